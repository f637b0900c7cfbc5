//! Broker facade and per-widget handles
//!
//! The broker wires every component together and hands each registered
//! widget a [`WidgetHandle`]: the capability surface scoped to that widget's
//! id, so a widget can never act as another widget.

mod core;
mod handle;

pub use self::core::Broker;
pub use self::handle::{LocalHandler, WidgetHandle};
