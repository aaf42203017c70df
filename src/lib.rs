pub mod audit;
pub mod bridge;
pub mod command;
pub mod describe;
pub mod dispatcher;
pub mod error;
pub mod interactive;
pub mod model;
pub mod paths;
pub mod project;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod state;
