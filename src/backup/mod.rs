pub mod archive;
pub mod backup_config;
pub mod cancel;
pub mod change;
pub mod classify;
pub mod compress;
pub mod file_ext;
pub mod finish;
pub mod fingerprint;
pub mod metadata;
pub mod observer;
pub mod pipeline;
pub mod restore;
pub mod result_error;
pub mod scan;
pub mod tar;
pub mod unit;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
