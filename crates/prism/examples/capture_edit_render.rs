use std::sync::Arc;

use prism::prelude::*;

/// Darken the left half of every RGBA row in place.
fn shade(frame: &mut FrameMut<'_>) {
    let format = frame.format();
    let stride = format.width as usize * 4;
    let half = format.crop.width as usize / 2 * 4;
    for row in frame.data_mut().chunks_mut(stride) {
        let end = half.min(row.len());
        for byte in &mut row[..end] {
            *byte /= 2;
        }
    }
}

fn main() -> Result<(), PipelineError> {
    prism::logging::init(true);

    let platform = Arc::new(VirtualPlatform::builder().source(1280, 720).build());
    let mut builder = PipelineBuilder::new(platform.clone())?;
    let branch = builder.configure_branch(0, 800, 600, Encoding::RGBA, true)?;
    builder.configure_presentation(branch, DisplayRegion::fullscreen(3))?;
    let pipeline = builder.finish_configuration()?;

    for _ in 0..10 {
        pipeline.capture_next_frame(branch)?;
        {
            let mut frame = pipeline.get_frame_mut(branch)?;
            shade(&mut frame);
        }
        pipeline.render_frame(branch)?;
    }

    for shown in platform.displayed() {
        println!(
            "seq={} len={} first_byte={:?} flags={:#x}",
            shown.sequence,
            shown.length,
            shown.first_byte,
            shown.flags.bits()
        );
    }
    Ok(())
}
