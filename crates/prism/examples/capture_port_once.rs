use std::sync::Arc;

use prism::prelude::*;

fn main() -> Result<(), PipelineError> {
    prism::logging::init(false);

    let platform = Arc::new(
        VirtualPlatform::builder()
            .source(1920, 1080)
            .empty_completions(true)
            .build(),
    );
    let mut builder = PipelineBuilder::new(platform.clone())?;
    let still = builder.configure_branch(0, 1920, 1080, Encoding::RGB24, false)?;
    builder.configure_source_port(0, SourcePort::Capture)?;
    let pipeline = builder.finish_configuration()?;

    for shot in 0..3 {
        pipeline.capture_next_frame(still)?;
        let frame = pipeline.get_frame(still)?;
        println!(
            "shot {shot}: seq={} {} ({} bytes)",
            frame.sequence(),
            frame.format(),
            frame.len()
        );
    }

    let stats = pipeline.branch_stats(still)?;
    println!(
        "delivered={} empty completions skipped={} preview frames discarded={}",
        stats.frames.delivered,
        stats.frames.empty_discarded,
        platform.discarded()
    );
    Ok(())
}
