pub mod baseline;
pub mod mqtt_service;
pub mod node_service;
pub mod reference_cell;
pub mod soiling;
