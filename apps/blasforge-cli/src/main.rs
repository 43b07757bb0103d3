//! blasforge command-line driver.
//!
//! Builds a batch of procedural box BLASes against the simulated device or a
//! real GPU and reports how much memory compaction saved.

mod options;
mod scene;

use ash::vk;
use blasforge_core::{
    AccelerationDevice, BatchAccelerationBuilder, BuildFlags, BuilderConfig, CompactionSummary,
    GeometryBuildInput, SimulatedDevice,
};
use blasforge_gpu::{GpuContextBuilder, VulkanAccelerationDevice};
use gpu_allocator::MemoryLocation;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use options::{Options, USAGE};
use scene::BoxScene;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::from_args();
    if options.help {
        println!("{USAGE}");
        return Ok(());
    }

    let scene = BoxScene::generate(&options);
    info!(
        items = scene.items.len(),
        boxes = scene.boxes.len(),
        gpu = options.gpu,
        "Generated box scene"
    );

    let summary = if options.gpu {
        run_gpu(&options, &scene)?
    } else {
        let inputs = scene.inputs(&options, 0);
        let mut builder =
            BatchAccelerationBuilder::new(SimulatedDevice::default(), BuilderConfig::default());
        run(&mut builder, &inputs, &options)?
    };

    info!(
        "Done: {} compacted, {} kept, {} KiB saved",
        summary.compacted,
        summary.skipped,
        summary.saved_bytes() / 1024
    );
    Ok(())
}

fn run_gpu(options: &Options, scene: &BoxScene) -> anyhow::Result<CompactionSummary> {
    let context = GpuContextBuilder::new()
        .app_name("blasforge")
        .validation(options.validation)
        .build()?;

    let mut box_buffer = context.allocator().lock().create_buffer(
        std::mem::size_of_val(scene.boxes.as_slice()) as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
        "box positions",
    )?;

    let result = box_buffer.write(&scene.boxes).map_err(anyhow::Error::from).and_then(|()| {
        let inputs = scene.inputs(options, box_buffer.device_address(context.device()));
        let device = VulkanAccelerationDevice::from_context(&context)?;
        let mut builder = BatchAccelerationBuilder::new(device, BuilderConfig::default());
        run(&mut builder, &inputs, options)
    });

    context.wait_idle()?;
    context.allocator().lock().free_buffer(&mut box_buffer)?;
    result
}

fn run<D: AccelerationDevice>(
    builder: &mut BatchAccelerationBuilder<D>,
    inputs: &[GeometryBuildInput],
    options: &Options,
) -> anyhow::Result<CompactionSummary> {
    let plan = builder.plan_batch(inputs, BuildFlags::DEFAULT_GLOBAL)?;
    let budget = options.budget.unwrap_or_else(|| {
        plan.peak_scratch_size
            .saturating_mul(4)
            .saturating_add(builder.device().scratch_padding())
    });
    info!(
        "Batch needs {} KiB of storage, {} KiB peak scratch; budget {} KiB",
        plan.total_storage_size / 1024,
        plan.peak_scratch_size / 1024,
        budget / 1024
    );

    let mut execution = builder.execute_batch(&plan, inputs, budget)?;
    info!(sub_batches = execution.sub_batches().len(), "Submitted builds");
    for failure in builder.discard_failed(&mut execution)? {
        warn!("{failure}; continuing with the remaining sub-batches");
    }

    let handles = if options.compact {
        builder.compact(execution, &plan)?
    } else {
        builder.finish(execution)?
    };

    let summary = CompactionSummary::from_handles(&handles);
    builder.destroy_handles(handles)?;
    Ok(summary)
}
