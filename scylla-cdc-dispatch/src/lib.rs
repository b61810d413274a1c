//! Async library for coordinated consumption of the [Scylla Change Data Capture](https://docs.scylladb.com/using-scylla/cdc/) log,
//! built on top of the [Scylla Rust Driver](https://docs.rs/scylla/latest/scylla/).
//!
//! # How reading is organized
//! A single background *master* discovers CDC stream generations, groups
//! each generation's streams by vnode and hands one task per
//! `(vnode, table)` to the workers through a transport. Each *worker* walks
//! its task's part of the log in closed time windows, delivers every change
//! to a user-supplied [`Consumer`](consumer::Consumer) and reports its
//! progress back, so that the master can advance to the next generation
//! once the current one is fully consumed (or its rows have all expired).
//!
//! # Getting started
//! The following code will start reading the CDC log from the first known
//! generation and print the type of every operation read.
//! ```rust,no_run
//! use async_trait::async_trait;
//! use scylla::client::session_builder::SessionBuilder;
//! use scylla_cdc_dispatch::consumer::{Consumer, ConsumerFactory, RawChange};
//! use scylla_cdc_dispatch::dispatcher::CdcDispatcherBuilder;
//! use std::sync::Arc;
//!
//! struct TypePrinterConsumer;
//!
//! #[async_trait]
//! impl Consumer for TypePrinterConsumer {
//!     async fn consume_cdc(&mut self, change: RawChange) -> anyhow::Result<()> {
//!         println!("{}", change.operation);
//!         Ok(())
//!     }
//! }
//!
//! struct TypePrinterConsumerFactory;
//!
//! #[async_trait]
//! impl ConsumerFactory for TypePrinterConsumerFactory {
//!     async fn new_consumer(&self) -> Box<dyn Consumer> {
//!         Box::new(TypePrinterConsumer)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Arc::new(
//!         SessionBuilder::new()
//!             .known_node("172.17.0.2:9042")
//!             .build()
//!             .await?,
//!     );
//!
//!     let factory = Arc::new(TypePrinterConsumerFactory);
//!
//!     let (_, handle) = CdcDispatcherBuilder::new()
//!         .session(session)
//!         .table("ks", "t")
//!         .consumer_factory(factory)
//!         .build()
//!         .await
//!         .expect("Creating the dispatcher failed!");
//!
//!     handle.await
//! }
//! ```
//!
//! # Other documentation
//! * [Documentation of Scylla Rust Driver](https://docs.rs/scylla/latest/scylla/)
//! * [Scylla documentation](https://docs.scylladb.com)
//! * [CDC documentation](https://docs.scylladb.com/using-scylla/cdc/)

pub mod cdc_types;
pub mod checkpoints;
pub mod config;
mod consistency;
pub mod consumer;
pub mod dispatcher;
pub mod generation;
pub mod local_transport;
pub mod master;
pub mod master_cql;
pub mod task;
pub mod time_uuid;
pub mod transport;
pub mod worker;
pub mod worker_cql;
