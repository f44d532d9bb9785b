pub mod backup_item;
pub mod backup_run;
pub mod settings;
