//! Scalezero - a scale-to-zero TCP reverse proxy for container-backed services
//!
//! This library provides a reverse proxy that:
//! - Listens on a fixed set of TCP ports, one or more per configured service
//! - Starts a service's container on demand when the first client connects
//! - Forwards bytes transparently while connections are live
//! - Arms a cooldown when the last connection closes and stops the container
//!   once it elapses, returning the service's CPU/memory/GPU reservation
//! - Admits container launches against a global resource budget
//! - Serializes all runtime-API calls per service while keeping distinct
//!   services fully concurrent

pub mod config;
pub mod controller;
pub mod docker;
pub mod keyed_mutex;
pub mod ports;
pub mod proxy;
pub mod reaper;
pub mod resources;
