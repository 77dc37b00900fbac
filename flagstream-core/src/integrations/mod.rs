#[cfg(feature = "file-data-source")]
pub mod files;
pub mod test_data;
