pub mod clock;
pub mod errors;
pub mod events;
pub mod ids;
pub mod model;
pub mod state;
