//! Error and warning reporting for module operations.
//!
//! Errors carry a category (which pipeline stage failed) and a numeric
//! code: zero is success, negative codes are universal, positive codes are
//! format-specific. Warnings accumulate as strings and never fail an
//! operation.

use std::fmt;

use thiserror::Error;

/// Which pipeline stage an error or status belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Category {
    #[default]
    None,
    Import,
    Export,
    Convert,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::None => "Init",
            Category::Import => "Import",
            Category::Export => "Export",
            Category::Convert => "Convert",
        };
        f.write_str(name)
    }
}

/// Universal convert error codes (negative; positive codes are
/// format-specific).
pub mod convert_error {
    pub const SUCCESS: i32 = 0;
    pub const UNSUCCESSFUL: i32 = -1;
    pub const INVALID_ARGUMENT: i32 = -2;
    pub const UNSUPPORTED_INPUT_TYPE: i32 = -3;
}

/// Universal export error codes.
pub mod export_error {
    pub const SUCCESS: i32 = 0;
    pub const FILE_OPEN: i32 = -1;
}

/// An error from importing, converting, or exporting a module.
#[derive(Clone, Debug, Error)]
#[error("ERROR: {category}: {message}")]
pub struct ModuleError {
    pub category: Category,
    pub code: i32,
    pub message: String,
}

impl ModuleError {
    pub fn new(category: Category, code: i32, message: impl Into<String>) -> Self {
        Self { category, code, message: message.into() }
    }

    pub fn import(code: i32, message: impl Into<String>) -> Self {
        Self::new(Category::Import, code, message)
    }

    pub fn export(code: i32, message: impl Into<String>) -> Self {
        Self::new(Category::Export, code, message)
    }

    pub fn convert(code: i32, message: impl Into<String>) -> Self {
        Self::new(Category::Convert, code, message)
    }
}

/// Error plus accumulated warnings for the last operation on a module.
#[derive(Clone, Debug, Default)]
pub struct Status {
    category: Category,
    error: Option<ModuleError>,
    warnings: Vec<String>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything and mark which operation is running.
    pub fn reset(&mut self, category: Category) {
        self.category = category;
        self.error = None;
        self.warnings.clear();
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn error_occurred(&self) -> bool {
        self.error.is_some()
    }

    pub fn warnings_issued(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn error(&self) -> Option<&ModuleError> {
        self.error.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn add_error(&mut self, error: ModuleError) {
        self.error = Some(error);
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(format!("WARNING: {}", message.into()));
    }
}
