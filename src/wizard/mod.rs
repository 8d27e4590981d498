// Wizard state machine: step catalog, persisted progress, handlers and the controller that ties
// them together.

pub mod controller;
pub mod lock;
pub mod registry;
pub mod steps;
pub mod store;
pub mod summary;
