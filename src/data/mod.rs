pub mod graph;
pub mod init;
pub mod nearest_neighbours;
pub mod similarities;
pub mod structures;
pub mod synthetic;
