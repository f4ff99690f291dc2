//! The diffbox inference worker: a long-lived process that takes jobs
//! from its controller over standard input and answers on standard
//! output.

pub mod progress;
pub mod protocol;
pub mod registry;
pub mod supervisor;
