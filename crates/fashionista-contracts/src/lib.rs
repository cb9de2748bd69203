pub mod controller;
pub mod descriptor;
pub mod events;
pub mod presets;
pub mod retry;
