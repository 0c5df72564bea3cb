pub mod archive;
pub mod archive_validator;
pub mod checksum;
pub mod database;
pub mod file_ext;
pub mod manifest;
pub mod notifications;
pub mod orchestrator;
pub mod process;
pub mod record;
pub mod redacted;
pub mod restore;
pub mod result_error;
pub mod retention;
pub mod schedule;
pub mod settings;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
