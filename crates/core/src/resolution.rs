//! Output resolution selection.
//!
//! A resolution is either one of the fixed presets offered to the user or
//! the `custom` sentinel, which only becomes a concrete size once the
//! explicit custom width/height are substituted via [`resolve`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/* --------------------------------------------------------------------------
Named constants
-------------------------------------------------------------------------- */

/// Token used for the custom-resolution sentinel in config and UI state.
pub const CUSTOM_TOKEN: &str = "custom";

/// Maximum dimension (width or height) accepted by the builder.
pub const MAX_DIMENSION: u32 = 8192;

/// Presets offered by the resolution picker, `(width, height)`.
pub const PRESETS: &[(u32, u32)] = &[
    (512, 512),
    (768, 768),
    (1024, 1024),
    (1152, 896),
    (896, 1152),
    (1216, 832),
    (832, 1216),
    (1344, 768),
    (768, 1344),
];

/// The resolution picked by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// A concrete size.
    Fixed { width: u32, height: u32 },
    /// Placeholder meaning "use the custom width/height fields".
    Custom,
}

impl Default for ResolutionChoice {
    fn default() -> Self {
        ResolutionChoice::Fixed {
            width: 1024,
            height: 1024,
        }
    }
}

impl fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionChoice::Fixed { width, height } => write!(f, "{width}x{height}"),
            ResolutionChoice::Custom => f.write_str(CUSTOM_TOKEN),
        }
    }
}

impl FromStr for ResolutionChoice {
    type Err = CoreError;

    /// Parse `"WxH"` or the `custom` token.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(CUSTOM_TOKEN) {
            return Ok(ResolutionChoice::Custom);
        }
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| CoreError::Validation(format!("Invalid resolution '{s}'")))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("Invalid width in '{s}'")))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("Invalid height in '{s}'")))?;
        validate_dimensions(width, height)?;
        Ok(ResolutionChoice::Fixed { width, height })
    }
}

/* --------------------------------------------------------------------------
Validation functions
-------------------------------------------------------------------------- */

/// Validate that width and height are positive and within bounds.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Validation(
            "Width and height must be greater than 0".to_string(),
        ));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(CoreError::Validation(format!(
            "Dimensions must not exceed {MAX_DIMENSION}px (got {width}x{height})"
        )));
    }
    Ok(())
}

/// Turn a resolution choice into a concrete `(width, height)`.
///
/// The custom sentinel is replaced by `custom`; a missing or zero custom
/// size is rejected so that no sentinel value ever reaches the backend.
pub fn resolve(
    choice: ResolutionChoice,
    custom: Option<(u32, u32)>,
) -> Result<(u32, u32), CoreError> {
    let (width, height) = match choice {
        ResolutionChoice::Fixed { width, height } => (width, height),
        ResolutionChoice::Custom => custom.ok_or_else(|| {
            CoreError::Validation("Custom resolution selected without width/height".to_string())
        })?,
    };
    validate_dimensions(width, height)?;
    Ok((width, height))
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */
