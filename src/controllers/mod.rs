pub mod node_controller;
