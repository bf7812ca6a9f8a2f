mod service;

pub use service::{CloudLocation, CloudOptions, CloudSessionService};
