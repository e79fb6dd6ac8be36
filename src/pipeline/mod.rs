pub mod alerter;
pub mod blocker;
pub mod campaign;
pub mod classifier;
pub mod detector;
pub mod parser;
pub mod reporter;
