#![allow(async_fn_in_trait)]
pub mod catalog;
pub mod cloudmask;
pub mod config;
pub mod element84;
pub mod error;
pub mod indices;
pub mod marker;
pub mod pipeline;
pub mod raster;
pub mod workspace;
