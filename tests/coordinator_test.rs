use crabcontrol::capture::{
    CaptureCoordinator, CoordinatorState, FrameStatus, GoalOutcome, GrabImagesFeedback,
    GrabImagesGoal,
};
use crabcontrol::device::{CameraDevice, DeviceFault, SimulatedCamera, SimulatedCameraConfig};
use crabcontrol::{CameraParameterSet, Hardware, PhotometricController};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Rig {
    camera: Arc<SimulatedCamera>,
    hardware: Arc<Hardware>,
    coordinator: Arc<CaptureCoordinator>,
}

fn rig_with(config: SimulatedCameraConfig, params: CameraParameterSet) -> Rig {
    let camera = Arc::new(SimulatedCamera::new(config));
    camera.open().unwrap();
    let params = Arc::new(params);
    let hardware = Arc::new(Hardware::new(camera.clone()));
    let photometry = Arc::new(PhotometricController::new(hardware.clone(), params.clone()));
    let coordinator = Arc::new(CaptureCoordinator::new(hardware.clone(), photometry, params));
    Rig {
        camera,
        hardware,
        coordinator,
    }
}

fn rig(config: SimulatedCameraConfig) -> Rig {
    rig_with(config, CameraParameterSet::default())
}

fn wait_for_frames(feedback: &crossbeam_channel::Receiver<GrabImagesFeedback>, n: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let update = feedback
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("capture stalled");
        if update.frames_completed >= n {
            return;
        }
    }
}

#[test]
fn test_five_frames_at_30fps() {
    let rig = rig(SimulatedCameraConfig::default().with_frame_rate(30.0));
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(5, Duration::from_secs(1)));
    let feedback = handle.feedback().clone();
    let result = handle.wait();

    assert_eq!(result.outcome, GoalOutcome::Succeeded);
    assert_eq!(result.frames.len(), 5);
    assert!(result.all_succeeded());
    let completed: Vec<u32> = feedback.try_iter().map(|f| f.frames_completed).collect();
    assert_eq!(completed, vec![1, 2, 3, 4, 5]);

    let sequences: Vec<u64> = result.images().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_cancel_returns_completed_frames_and_releases_lock() {
    let rig = rig(SimulatedCameraConfig {
        frame_interval: Duration::from_millis(40),
        ..Default::default()
    });
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(50, Duration::from_secs(1)));
    let feedback = handle.feedback().clone();
    wait_for_frames(&feedback, 2);
    handle.cancel();
    let result = handle.wait();

    assert_eq!(result.outcome, GoalOutcome::Preempted);
    // Frames completed before the cancellation was observed: at least the two
    // already reported, plus at most the one in flight
    assert!(result.frames.len() >= 2 && result.frames.len() <= 3);
    // Every returned frame was reported as feedback, and nothing else
    let reported = 2 + feedback.try_iter().count();
    assert_eq!(reported, result.frames.len());
    assert!(result.all_succeeded());

    assert!(!rig.hardware.is_locked());
    assert_eq!(rig.coordinator.state(), CoordinatorState::Idle);
    let started = Instant::now();
    rig.coordinator.grab_image().unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_cancel_before_first_frame_returns_no_frames() {
    let rig = rig(SimulatedCameraConfig {
        ready_after: Duration::from_millis(150),
        ..Default::default()
    });
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(5, Duration::from_secs(1)));
    // Still waiting for readiness
    handle.cancel();
    let result = handle.wait();
    assert_eq!(result.outcome, GoalOutcome::Preempted);
    assert!(result.frames.is_empty());
    assert_eq!(rig.camera.grab_calls(), 0);
}

#[test]
fn test_new_goal_preempts_running_goal() {
    let rig = rig(SimulatedCameraConfig::default().with_frame_rate(30.0));
    let first = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(100, Duration::from_secs(1)));
    wait_for_frames(first.feedback(), 1);

    let second = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(2, Duration::from_secs(1)));

    let first = first.wait();
    assert_eq!(first.outcome, GoalOutcome::Preempted);
    assert!(first.frames.len() < 100);

    let second = second.wait();
    assert_eq!(second.outcome, GoalOutcome::Succeeded);
    assert_eq!(second.frames.len(), 2);
    assert_eq!(rig.coordinator.active_goal(), None);
}

#[test]
fn test_sleep_refused_during_capture() {
    let rig = rig(SimulatedCameraConfig::default().with_frame_rate(30.0));
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(100, Duration::from_secs(1)));
    wait_for_frames(handle.feedback(), 1);
    assert_eq!(rig.coordinator.state(), CoordinatorState::MultiGrabInProgress);

    let err = rig.coordinator.set_sleeping(true).unwrap_err();
    assert!(matches!(err, crabcontrol::CameraError::CaptureInProgress(_)));
    assert!(!rig.coordinator.is_sleeping());

    handle.cancel();
    handle.wait();

    rig.coordinator.set_sleeping(true).unwrap();
    for _ in 0..3 {
        assert!(rig.coordinator.grab_image().unwrap_err().is_sleeping());
    }
    rig.coordinator.set_sleeping(false).unwrap();
    assert!(rig.coordinator.grab_image().is_ok());
}

#[test]
fn test_frame_timeout_is_recorded_and_capture_continues() {
    let rig = rig(SimulatedCameraConfig::default());
    rig.camera.inject_fault(2, DeviceFault::Timeout);
    let result = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(4, Duration::from_millis(30)))
        .wait();

    assert_eq!(result.outcome, GoalOutcome::SucceededWithErrors);
    assert!(result.outcome.is_success());
    assert_eq!(result.success_flags(), vec![true, true, false, true]);
    assert_eq!(result.frames[2].status, FrameStatus::TimedOut);
    assert!(result.frames[2].frame.is_none());
}

#[test]
fn test_goal_rejected_when_camera_never_ready() {
    let params = CameraParameterSet {
        startup_timeout_ms: 50,
        ..Default::default()
    };
    let rig = rig_with(
        SimulatedCameraConfig {
            ready_after: Duration::from_secs(30),
            ..Default::default()
        },
        params,
    );
    let result = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(3, Duration::from_secs(1)))
        .wait();
    assert_eq!(result.outcome, GoalOutcome::Rejected);
    assert!(result.frames.is_empty());
    assert_eq!(rig.camera.grab_calls(), 0);
}

#[test]
fn test_single_grab_queues_behind_capture() {
    let rig = rig(SimulatedCameraConfig {
        frame_interval: Duration::from_millis(20),
        ..Default::default()
    });
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(5, Duration::from_secs(1)));
    wait_for_frames(handle.feedback(), 1);

    let coordinator = rig.coordinator.clone();
    let single = std::thread::spawn(move || coordinator.grab_image());
    let result = handle.wait();
    let frame = single.join().unwrap().unwrap();

    assert_eq!(result.frames.len(), 5);
    // Serialized after all five goal frames
    assert_eq!(frame.sequence, 6);
}

#[test]
fn test_per_frame_exposure_overrides() {
    let rig = rig(SimulatedCameraConfig::default());
    let goal =
        GrabImagesGoal::with_exposures(vec![500.0, 5_000.0, 20_000.0], Duration::from_secs(1));
    let result = rig.coordinator.grab_images(goal).wait();
    assert_eq!(result.outcome, GoalOutcome::Succeeded);

    let brightness: Vec<f64> = result
        .images()
        .map(|f| crabcontrol::photometry::calc_brightness(f).unwrap())
        .collect();
    assert!(brightness[0] < brightness[1]);
    assert!(brightness[1] < brightness[2]);
    assert_eq!(rig.camera.exposure().unwrap(), 20_000.0);
}

#[test]
fn test_per_frame_brightness_and_gamma_overrides() {
    let rig = rig(SimulatedCameraConfig::default());
    let goal = GrabImagesGoal::new(3, Duration::from_secs(1))
        .gammas(vec![1.0, 1.5, 1.0])
        .brightnesses(vec![20.0, 240.0, 5.0], true, false);
    let mut handle = rig.coordinator.grab_images(goal);

    // Each brightness search re-enters the lock the capture already holds
    let result = handle
        .wait_timeout(Duration::from_secs(20))
        .expect("goal with brightness overrides stalled");
    assert_eq!(result.outcome, GoalOutcome::Succeeded, "{:?}", result.message);
    assert_eq!(result.frames.len(), 3);

    let gammas: Vec<_> = result.frames.iter().map(|r| r.reached_gamma).collect();
    assert_eq!(gammas, vec![Some(1.0), Some(1.5), Some(1.0)]);
    for (record, target) in result.frames.iter().zip([20.0, 240.0, 5.0]) {
        let reached = record.reached_brightness.expect("brightness not reported");
        assert!((reached - target).abs() <= 2.0, "frame {}: {reached}", record.index);
        assert!(record.reached_exposure.is_some());
        assert!(record.frame.is_some());
    }
    assert!(!rig.hardware.is_locked());
    assert_eq!(rig.coordinator.state(), CoordinatorState::Idle);
}

#[test]
fn test_oversized_goal_rejected_without_allocating() {
    let rig = rig(SimulatedCameraConfig::default());
    let result = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(u32::MAX, Duration::from_millis(100)))
        .wait();
    assert_eq!(result.outcome, GoalOutcome::Rejected);
    assert!(result.frames.is_empty());
    assert_eq!(rig.camera.grab_calls(), 0);
}

#[test]
fn test_wait_for_camera_does_not_block_on_capture() {
    let rig = rig(SimulatedCameraConfig::default().with_frame_rate(30.0));
    let handle = rig
        .coordinator
        .grab_images(GrabImagesGoal::new(100, Duration::from_secs(1)));
    wait_for_frames(handle.feedback(), 1);

    let started = Instant::now();
    assert!(rig.coordinator.wait_for_camera(Duration::from_secs(1)));
    assert!(started.elapsed() < Duration::from_millis(200));

    handle.cancel();
    handle.wait();
}
