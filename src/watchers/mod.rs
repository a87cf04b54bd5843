//! External-chain watchers: block scanning and event classification

pub mod classifier;
pub mod scanner;

pub use classifier::{Classification, Classifier};
pub use scanner::{BlockScanner, ScanOutcome};
