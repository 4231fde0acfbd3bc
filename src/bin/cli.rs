use anyhow::{anyhow, bail, Context, Result};
use crabcontrol::commands::{self, GrabImagesRequest, SetBrightnessRequest};
use crabcontrol::{CameraDevice, CameraNode, CameraParameterSet};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const USAGE: &str = "Usage: crabcontrol-cli [--config <file>] [--json] <command> [args]

Commands:
  grab
  grab-images <n> [--exposures a,b,..] [--gains a,b,..] [--gammas a,b,..]
              [--brightnesses a,b,..] [--exposure-auto] [--gain-auto] [--timeout <ms>]
  set-exposure <us>
  set-gain <percent>
  set-gamma <value>
  set-brightness <1-255> [--exposure-auto] [--gain-auto]
  sleep <on|off>
  digital-output <id> <on|off>
  spin [--frames <n>]";

struct Options {
    config: Option<PathBuf>,
    json: bool,
    command: String,
    args: Vec<String>,
}

fn parse_options(raw: &[String]) -> Result<Options> {
    let mut config = None;
    let mut json = false;
    let mut rest = Vec::new();

    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--config" => {
                i += 1;
                let path = raw.get(i).ok_or_else(|| anyhow!("--config needs a file"))?;
                config = Some(PathBuf::from(path));
            }
            "--json" => json = true,
            _ => rest.push(raw[i].clone()),
        }
        i += 1;
    }

    if rest.is_empty() {
        bail!("{}", USAGE);
    }
    let command = rest.remove(0);
    Ok(Options {
        config,
        json,
        command,
        args: rest,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    crabcontrol::init_logging();

    let raw: Vec<String> = env::args().skip(1).collect();
    let options = match parse_options(&raw) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let params = CameraParameterSet::load(options.config.as_deref())
        .context("Failed to load camera parameters")?;
    let device = open_device(&params)?;
    let node = Arc::new(CameraNode::new(params, device)?);
    node.init().context("Camera initialization failed")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let node = Arc::clone(&node);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
            node.coordinator().cancel_active();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let result = run(&node, &options, &stop).await;
    if let Err(e) = node.shutdown() {
        log::warn!("Shutdown failed: {}", e);
    }
    result
}

#[cfg(feature = "hardware")]
fn open_device(params: &CameraParameterSet) -> Result<Arc<dyn CameraDevice>> {
    let camera = crabcontrol::NokhwaCamera::new(&params.device_user_id)?;
    Ok(Arc::new(camera))
}

#[cfg(not(feature = "hardware"))]
fn open_device(params: &CameraParameterSet) -> Result<Arc<dyn CameraDevice>> {
    use crabcontrol::{SimulatedCamera, SimulatedCameraConfig};
    let mut config = SimulatedCameraConfig::default().with_frame_rate(30.0);
    if !params.device_user_id.is_empty() {
        config.device_id = params.device_user_id.clone();
    }
    config.encoding = params.image_encoding;
    Ok(Arc::new(SimulatedCamera::new(config)))
}

async fn run(node: &Arc<CameraNode>, options: &Options, stop: &Arc<AtomicBool>) -> Result<()> {
    let args = &options.args;
    match options.command.as_str() {
        "grab" => cmd_grab(node, options.json).await,
        "grab-images" => cmd_grab_images(node, args, options.json).await,
        "set-exposure" => {
            let target = positional(args, 0, "exposure")?;
            let reply = commands::set_exposure(Arc::clone(node), target)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "set-gain" => {
            let target = positional(args, 0, "gain")?;
            let reply = commands::set_gain(Arc::clone(node), target)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "set-gamma" => {
            let target = positional(args, 0, "gamma")?;
            let reply = commands::set_gamma(Arc::clone(node), target)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "set-brightness" => {
            let target = positional(args, 0, "brightness")?;
            let gain_auto = has_flag(args, "--gain-auto");
            // Exposure is searched unless only gain was asked for
            let exposure_auto = has_flag(args, "--exposure-auto") || !gain_auto;
            let request = SetBrightnessRequest {
                target,
                exposure_auto,
                gain_auto,
            };
            let reply = commands::set_brightness(Arc::clone(node), request)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "sleep" => {
            let sleeping = parse_switch(args.first())?;
            let reply = commands::set_sleeping(Arc::clone(node), sleeping)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "digital-output" => {
            let output_id: u32 = positional(args, 0, "output id")?;
            let value = parse_switch(args.get(1))?;
            let reply = commands::set_digital_output(Arc::clone(node), output_id, value)
                .await
                .map_err(anyhow::Error::msg)?;
            print_reply(options.json, &reply)
        }
        "spin" => cmd_spin(node, args, stop),
        other => {
            eprintln!("Unknown command: {}\n{}", other, USAGE);
            std::process::exit(1);
        }
    }
}

async fn cmd_grab(node: &Arc<CameraNode>, json: bool) -> Result<()> {
    let frame = commands::grab_image(Arc::clone(node))
        .await
        .map_err(anyhow::Error::msg)?;
    let brightness = node.photometry().current_brightness().unwrap_or_default();
    if json {
        println!("{}", serde_json::to_string(&frame)?);
    } else {
        println!(
            "Frame: {}x{} {} seq:{} brightness:{:.1}",
            frame.width, frame.height, frame.encoding, frame.sequence, brightness
        );
    }
    Ok(())
}

async fn cmd_grab_images(node: &Arc<CameraNode>, args: &[String], json: bool) -> Result<()> {
    let count: u32 = positional(args, 0, "frame count")?;
    let exposure_times = float_list(args, "--exposures")?;
    let gain_values = float_list(args, "--gains")?;
    let gamma_values = float_list(args, "--gammas")?;
    let brightness_values = float_list(args, "--brightnesses")?;
    let gain_auto = has_flag(args, "--gain-auto");
    let timeout_ms = flag_value(args, "--timeout")
        .map(|v| v.parse::<u64>())
        .transpose()
        .context("Invalid --timeout")?
        .unwrap_or(0);

    let request = GrabImagesRequest {
        count,
        exposure_times,
        gain_values,
        gamma_values,
        brightness_values,
        exposure_auto: has_flag(args, "--exposure-auto") || !gain_auto,
        gain_auto,
        timeout_ms,
    };
    let handle = commands::grab_images(Arc::clone(node), request)
        .await
        .map_err(anyhow::Error::msg)?;

    let feedback = handle.feedback().clone();
    let progress = std::thread::spawn(move || {
        for update in feedback.iter() {
            log::info!("{}/{} frame(s)", update.frames_completed, update.total);
        }
    });

    let response = commands::wait_for_result(handle)
        .await
        .map_err(anyhow::Error::msg)?;
    let _ = progress.join();

    if json {
        println!("{}", serde_json::to_string(&response)?);
    } else {
        println!("Goal {}: {:?}", response.goal_id, response.outcome);
        for (i, (ok, reached)) in response
            .frame_success
            .iter()
            .zip(&response.reached)
            .enumerate()
        {
            print!("  frame {}: {}", i, if *ok { "ok" } else { "failed" });
            if let Some(brightness) = reached.brightness {
                print!(" brightness:{:.1}", brightness);
            }
            if let Some(exposure) = reached.exposure {
                print!(" exposure:{:.0}", exposure);
            }
            println!();
        }
        if let Some(message) = &response.message {
            println!("  {}", message);
        }
    }
    Ok(())
}

fn cmd_spin(node: &Arc<CameraNode>, args: &[String], stop: &Arc<AtomicBool>) -> Result<()> {
    let limit = flag_value(args, "--frames")
        .map(|v| v.parse::<u64>())
        .transpose()
        .context("Invalid --frames")?;

    let subscription = node.subscribe(8);
    let printer = {
        let stop = Arc::clone(stop);
        std::thread::spawn(move || {
            let mut received = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let next = subscription.recv_timeout(std::time::Duration::from_millis(200));
                if let Some(image) = next {
                    received += 1;
                    println!(
                        "{} {}x{} seq:{} frame_id:{}",
                        image.info.timestamp.to_rfc3339(),
                        image.info.width,
                        image.info.height,
                        image.frame.sequence,
                        image.info.frame_id
                    );
                    if limit.is_some_and(|n| received >= n) {
                        stop.store(true, Ordering::SeqCst);
                    }
                }
            }
        })
    };

    node.spin(stop);
    let _ = printer.join();
    Ok(())
}

fn print_reply<T: serde::Serialize + std::fmt::Debug>(json: bool, reply: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(reply)?);
    } else {
        println!("{:?}", reply);
    }
    Ok(())
}

fn positional<T>(args: &[String], index: usize, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = args
        .iter()
        .filter(|a| !a.starts_with("--"))
        .nth(index)
        .ok_or_else(|| anyhow!("missing {}\n{}", name, USAGE))?;
    raw.parse::<T>()
        .with_context(|| format!("invalid {}: {}", name, raw))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Comma-separated numbers after `flag`, if present
fn float_list(args: &[String], flag: &str) -> Result<Option<Vec<f64>>> {
    flag_value(args, flag)
        .map(|list| {
            list.split(',')
                .map(|v| v.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .with_context(|| format!("Invalid {} list", flag))
}

fn parse_switch(value: Option<&String>) -> Result<bool> {
    match value.map(String::as_str) {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        other => Err(anyhow!("expected on|off, got {:?}", other)),
    }
}
