//! Ready-made modules

mod printer;
mod pump;

pub use printer::BlobPrinter;
pub use pump::CountingPump;
