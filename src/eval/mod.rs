pub mod report;

pub use report::{EvalReport, RunSettings, SummaryRow};
