pub mod channel;
pub mod drops;
pub mod settings;
