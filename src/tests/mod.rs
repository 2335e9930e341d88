mod common;
mod metrics_tests;
