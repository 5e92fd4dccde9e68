use std::sync::Arc;

use prism::prelude::*;

fn main() -> Result<(), PipelineError> {
    prism::logging::init(false);
    PrismConfig::new().pool(3, 1).apply();

    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(1920, 1080)
            .screen(1280, 720)
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform.clone())?;
    let screen = builder.screen_size()?;
    let preview = builder.configure_branch(0, 640, 480, Encoding::RGBA, true)?;
    let thumbs = builder.configure_branch(0, 320, 240, Encoding::I420, false)?;
    builder.configure_presentation(
        preview,
        DisplayRegion::windowed(Rect::new(0, 0, screen.width.get(), screen.height.get()), 2),
    )?;
    let pipeline = builder.finish_configuration()?;
    println!(
        "upstream {:?}, branches {:?}",
        pipeline.upstream_format(0),
        pipeline.branches()
    );

    for n in 0..30 {
        pipeline.capture_next_frame(preview)?;
        {
            let frame = pipeline.get_frame(preview)?;
            println!(
                "#{n:02} seq={} len={} first_byte={}",
                frame.sequence(),
                frame.len(),
                frame.first().copied().unwrap_or_default()
            );
        }
        pipeline.render_frame(preview)?;

        if n % 10 == 0 {
            pipeline.capture_next_frame(thumbs)?;
            let thumb = pipeline.get_frame(thumbs)?;
            println!("    thumbnail {} ({} bytes)", thumb.format(), thumb.len());
        }
    }

    for branch in pipeline.branches() {
        let stats = pipeline.branch_stats(branch)?;
        println!(
            "branch {branch}: delivered={} rendered={} empty={} avg_wait_ms={:.2?} pool={:?}",
            stats.frames.delivered,
            stats.frames.rendered,
            stats.frames.empty_discarded,
            stats.avg_capture_millis,
            stats.pool
        );
    }
    println!("displayed {} frames", platform.displayed().len());
    pipeline.teardown();
    Ok(())
}
