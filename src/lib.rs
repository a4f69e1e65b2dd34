#![allow(dead_code)]

pub use nakamoto_net::{LocalDuration, LocalTime};

pub mod clock;
pub mod digitree;
pub mod estimator;
pub mod heuristic;
pub mod relevance;
pub mod ring;
pub mod runtime;
pub mod selector;
pub mod service;
pub mod sim;

#[cfg(test)]
mod test;

pub fn run() -> anyhow::Result<()> {
    Ok(())
}
