use std::sync::Arc;

use prism::prelude::*;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    prism::logging::init(false);

    let platform = Arc::new(VirtualPlatform::builder().source(1280, 720).build());
    let mut builder = PipelineBuilder::new(platform)?;
    let branch = builder.configure_branch(0, 640, 360, Encoding::BGRA, true)?;
    builder.configure_presentation(branch, DisplayRegion::fullscreen(1))?;
    let pipeline = builder.finish_configuration()?;

    for n in 0..20 {
        pipeline.capture_next_frame_async(branch).await?;
        let sequence = pipeline.get_frame(branch)?.sequence();
        pipeline.render_frame(branch)?;
        println!("#{n:02} seq={sequence}");
    }

    let metrics = pipeline.capture_metrics(branch)?;
    println!(
        "capture samples={} avg_wait_ms={:.2?} fps={:.1?}",
        metrics.total_samples(),
        metrics.avg_millis(),
        metrics.fps()
    );
    Ok(())
}
