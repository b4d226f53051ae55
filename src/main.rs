use blobflow::logger::init_tracing;
use blobflow::pipeline::modules::{BlobPrinter, CountingPump};
use blobflow::{Attachment, Pipeline, PipeResult};

/// Demo pipeline: pumps ten blobs unless `pipeline.toml` says otherwise
fn main() -> PipeResult<()> {
    init_tracing();

    let mut pipeline = Pipeline::builder("blobflow-demo")
        .timeit(true)
        .handle_ctrl_c(true)
        .build()?;

    pipeline.attach(Attachment::module(CountingPump::new()).with("max_count", 10))?;
    pipeline.attach_module(BlobPrinter::new())?;

    let report = pipeline.drain(None)?;
    if report.was_interrupted() {
        std::process::exit(blobflow::interrupt::INTERRUPT_EXIT_CODE);
    }
    Ok(())
}
