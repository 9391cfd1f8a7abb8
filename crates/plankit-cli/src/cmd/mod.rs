pub mod backup;
pub mod migrations;
pub mod status;
pub mod upgrade;
