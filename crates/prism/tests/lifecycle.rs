use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use prism::prelude::*;

fn build_with_failure(point: FailPoint) -> (Arc<VirtualPlatform>, PipelineError) {
    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(1280, 720)
            .fail_on(point)
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let branch = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_branch(0, 320, 240, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_presentation(branch, DisplayRegion::fullscreen(1))
        .unwrap();
    let err = match builder.finish_configuration() {
        Ok(_) => panic!("construction should fail at {point:?}"),
        Err(err) => err,
    };
    (platform, err)
}

#[test]
fn construction_failures_destroy_every_stage() {
    let points = [
        FailPoint::CreateStage(StageKind::Presentation),
        FailPoint::CreateStage(StageKind::Processor),
        FailPoint::CommitFormat(StageKind::Splitter),
        FailPoint::EnablePort(StageKind::Presentation),
        FailPoint::CreateConnection(ConnectionMode::Managed),
        FailPoint::EnableConnection(ConnectionMode::Managed),
    ];
    for point in points {
        let (platform, err) = build_with_failure(point);
        assert_eq!(err.kind(), ErrorKind::Resource, "{point:?}");
        assert!(matches!(err, PipelineError::Stage { .. }));
        assert!(!platform.created_stages().is_empty());
        assert!(platform.live_stages().is_empty(), "{point:?}");
    }
}

#[test]
fn nothing_configured_creates_nothing() {
    let platform = Arc::new(VirtualPlatform::new());
    let builder = PipelineBuilder::new(platform.clone()).unwrap();
    let err = builder.finish_configuration().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(platform.created_stages().is_empty());
}

#[test]
fn capture_port_mode_triggers_once_per_capture() {
    let platform = Arc::new(VirtualPlatform::builder().source(1920, 1080).build());
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let branch = builder
        .configure_branch(0, 1920, 1080, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_source_port(0, SourcePort::Capture)
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();

    let mut last = 0;
    for _ in 0..3 {
        pipeline.capture_next_frame(branch).unwrap();
        let sequence = pipeline.get_frame(branch).unwrap().sequence();
        assert!(sequence > last);
        last = sequence;
    }
    let triggers = platform
        .events()
        .iter()
        .filter(|e| matches!(e, PlatformEvent::CaptureTriggered(_)))
        .count();
    assert_eq!(triggers, 3);

    // The preview port keeps streaming into the discard sink.
    let deadline = Instant::now() + Duration::from_secs(2);
    while platform.discarded() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(platform.discarded() > 0);
    assert_eq!(
        pipeline.branch_format(branch).unwrap().visible(),
        Resolution::new(1920, 1080)
    );
}

#[test]
fn trigger_failure_is_reported() {
    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(640, 480)
            .fail_on(FailPoint::Trigger)
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform).unwrap();
    let branch = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_source_port(0, SourcePort::Capture)
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();
    let err = pipeline.capture_next_frame(branch).unwrap_err();
    assert!(matches!(err, PipelineError::Trigger(_)));
    assert_eq!(pipeline.branch_state(branch).unwrap(), BranchState::Idle);
    let pool = pipeline.branch_stats(branch).unwrap().pool;
    assert_eq!((pool.held, pool.forwarded), (0, 0));
}

#[test]
fn teardown_unblocks_waiting_capture() {
    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(640, 480)
            .frame_interval(Duration::from_secs(600))
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let branch = builder
        .configure_branch(0, 320, 240, Encoding::RGBA, true)
        .unwrap();
    let pipeline = Arc::new(builder.finish_configuration().unwrap());
    // Let the frame produced when the connections came up drain away.
    thread::sleep(Duration::from_millis(50));

    let waiter = {
        let pipeline = pipeline.clone();
        thread::spawn(move || pipeline.capture_next_frame(branch))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());
    pipeline.teardown();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(PipelineError::TornDown)));
    assert_eq!(pipeline.lifecycle(), Lifecycle::TornDown);
    assert!(platform.live_stages().is_empty());
    assert!(matches!(
        pipeline.get_frame(branch),
        Err(PipelineError::TornDown)
    ));
}

#[test]
fn dropping_pipeline_tears_down() {
    let platform = Arc::new(VirtualPlatform::new());
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let branch = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_presentation(branch, DisplayRegion::fullscreen(1))
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();
    pipeline.capture_next_frame(branch).unwrap();
    pipeline.render_frame(branch).unwrap();
    drop(pipeline);
    assert!(platform.live_stages().is_empty());
    let disabled = platform
        .events()
        .iter()
        .filter(|e| matches!(e, PlatformEvent::ConnectionDisabled(_)))
        .count();
    assert_eq!(disabled, 3);
}
