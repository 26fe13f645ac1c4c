pub mod node_routes;
