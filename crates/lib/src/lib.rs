//! Courier core library: message envelopes, session store, middleware, routing and the
//! dispatcher, plus the worker runtime and in-process bus they run on.

pub mod application;
pub mod audit;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod routing;
pub mod session;
pub mod transport;
pub mod worker;
