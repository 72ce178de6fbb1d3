#![warn(dead_code)]
#![warn(unused_imports)]
#![warn(unused_variables)]

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod encoder;
pub mod epoch;
pub mod error;
pub mod eval;
pub mod extractor;
pub mod imaging;
pub mod layers;
pub mod loss;
pub mod models;
pub mod pipeline;
pub mod prior;
pub mod state;
pub mod telemetry;
pub mod training;
pub mod variation;
