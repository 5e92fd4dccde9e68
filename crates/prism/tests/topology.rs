use std::sync::Arc;

use prism::prelude::*;

fn platform(width: u32, height: u32) -> Arc<VirtualPlatform> {
    Arc::new(VirtualPlatform::builder().source(width, height).build())
}

#[test]
fn branch_bounds_follow_source_maximum() {
    let sizes = [
        (1, 1, true),
        (640, 480, true),
        (1280, 720, true),
        (1281, 720, false),
        (1280, 721, false),
        (4000, 10, false),
        (0, 10, false),
        (10, 0, false),
    ];
    for (width, height, ok) in sizes {
        let mut builder = PipelineBuilder::new(platform(1280, 720)).unwrap();
        let result = builder.configure_branch(0, width, height, Encoding::RGBA, true);
        assert_eq!(result.is_ok(), ok, "{width}x{height}");
        if let Err(err) = result {
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(!builder.source(0).unwrap().in_use());
        }
    }
}

#[test]
fn fifth_branch_leaves_first_four_intact() {
    let mut builder = PipelineBuilder::new(platform(1280, 720)).unwrap();
    let sizes = [(320, 240), (640, 480), (160, 120), (1280, 720)];
    for (width, height) in sizes {
        builder
            .configure_branch(0, width, height, Encoding::RGBA, true)
            .unwrap();
    }
    let before = builder.source(0).unwrap().clone();
    let err = builder
        .configure_branch(0, 64, 64, Encoding::RGBA, true)
        .unwrap_err();
    assert_eq!(err.code(), "too_many_branches");
    assert_eq!(builder.source(0).unwrap(), &before);

    let pipeline = builder.finish_configuration().unwrap();
    assert_eq!(pipeline.branches().len(), 4);
}

#[test]
fn fan_out_is_provisioned_for_largest_branch() {
    let platform = platform(1280, 720);
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let small = builder
        .configure_branch(0, 320, 240, Encoding::RGBA, true)
        .unwrap();
    let large = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();

    let upstream = pipeline.upstream_format(0).unwrap();
    assert!(upstream.width >= 640 && upstream.height >= 480);
    for port in platform.ports_of(StageKind::Splitter, PortDirection::Input) {
        let format = platform.port_info(port).unwrap().format.unwrap();
        assert_eq!(format, upstream);
    }

    let outputs: Vec<_> = platform
        .ports_of(StageKind::Processor, PortDirection::Output)
        .into_iter()
        .filter_map(|port| platform.port_info(port).and_then(|info| info.format))
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].crop.width, 320);
    assert_eq!(outputs[1].crop.width, 640);

    for (branch, (width, height)) in [(small, (320, 240)), (large, (640, 480))] {
        pipeline.capture_next_frame(branch).unwrap();
        let frame = pipeline.get_frame(branch).unwrap();
        assert_eq!(frame.len(), frame.format().frame_size());
        assert_eq!(frame.len(), (width * height * 4) as usize);
    }
}

#[test]
fn stage_graph_shape() {
    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(1920, 1080)
            .source(1280, 720)
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let shown = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_branch(0, 320, 240, Encoding::I420, false)
        .unwrap();
    builder
        .configure_presentation(shown, DisplayRegion::fullscreen(2))
        .unwrap();
    builder
        .configure_branch(1, 1280, 720, Encoding::BGR24, true)
        .unwrap();
    builder
        .configure_source_port(1, SourcePort::Capture)
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();

    let count = |kind| {
        platform
            .live_stages()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    };
    assert_eq!(count(StageKind::Source), 2);
    assert_eq!(count(StageKind::Splitter), 2);
    assert_eq!(count(StageKind::Processor), 3);
    assert_eq!(count(StageKind::Presentation), 1);
    assert_eq!(count(StageKind::DiscardSink), 1);

    let presentation = platform.ports_of(StageKind::Presentation, PortDirection::Input)[0];
    let info = platform.port_info(presentation).unwrap();
    assert_eq!(info.region, Some(DisplayRegion::fullscreen(2)));
    assert!(info.zero_copy);
    assert_eq!(info.format.unwrap().crop.width, 640);
    assert_eq!(pipeline.lifecycle(), Lifecycle::Ready);
}

#[test]
fn callbacks_enabled_before_connections() {
    let platform = platform(1280, 720);
    let mut builder = PipelineBuilder::new(platform.clone()).unwrap();
    let branch = builder
        .configure_branch(0, 640, 480, Encoding::RGBA, true)
        .unwrap();
    builder
        .configure_presentation(branch, DisplayRegion::fullscreen(1))
        .unwrap();
    let _pipeline = builder.finish_configuration().unwrap();

    let events = platform.events();
    let first_enabled = events
        .iter()
        .position(|e| matches!(e, PlatformEvent::ConnectionEnabled(_)))
        .unwrap();
    let last_port = events
        .iter()
        .rposition(|e| matches!(e, PlatformEvent::PortEnabled(_)))
        .unwrap();
    assert!(last_port < first_enabled);

    let created: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlatformEvent::ConnectionCreated(id, _) => Some(*id),
            _ => None,
        })
        .collect();
    let enabled: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlatformEvent::ConnectionEnabled(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 3);
    assert_eq!(created, enabled);
    let modes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PlatformEvent::ConnectionCreated(_, mode) => Some(*mode),
            _ => None,
        })
        .collect();
    assert_eq!(
        modes,
        [
            ConnectionMode::Tunnelled,
            ConnectionMode::Tunnelled,
            ConnectionMode::Managed
        ]
    );
}

#[test]
fn pool_sizing_follows_tunables() {
    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(640, 480)
            .port_buffers(2)
            .build(),
    );
    let tunables = Tunables {
        pool_min: 5,
        pool_spare: 2,
        upstream_encoding: Encoding::RGBA,
    };
    let mut builder = PipelineBuilder::new(platform).unwrap().with_tunables(tunables);
    let branch = builder
        .configure_branch(0, 320, 240, Encoding::RGBA, true)
        .unwrap();
    let pipeline = builder.finish_configuration().unwrap();
    let stats = pipeline.branch_stats(branch).unwrap();
    assert_eq!(stats.pool.total, 7);
    assert_eq!(stats.pool.in_flight, 7);
}
