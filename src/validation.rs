//! Input validation for the whiteboard.
//!
//! All validators return BoardError::Validation on failure.

use crate::error::{BoardError, BoardResult};
use crate::models::{NoteProperties, PropertiesPatch};

pub const MAX_NOTE_CONTENT_LENGTH: usize = 100_000; // 100KB of text
pub const MAX_SEARCH_QUERY_LENGTH: usize = 500;
pub const MIN_PASSWORD_LENGTH: usize = 4;
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Validate note content.
///
/// Whiteboard notes may be empty (a freshly placed sticky note), so only the
/// length is checked.
pub fn validate_note_content(content: &str) -> BoardResult<()> {
    let len = content.chars().count();
    if len > MAX_NOTE_CONTENT_LENGTH {
        return Err(BoardError::validation(
            "content",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_NOTE_CONTENT_LENGTH, len
            ),
        ));
    }
    Ok(())
}

/// Validate a search query.
pub fn validate_search_query(query: &str) -> BoardResult<()> {
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        return Err(BoardError::validation(
            "search_query",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_SEARCH_QUERY_LENGTH,
                query.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a whiteboard password before it is hashed or sent anywhere.
pub fn validate_password(password: &str) -> BoardResult<()> {
    if password.trim().is_empty() {
        return Err(BoardError::validation(
            "password",
            "cannot be empty or whitespace only",
        ));
    }

    let len = password.chars().count();
    if len < MIN_PASSWORD_LENGTH {
        return Err(BoardError::validation(
            "password",
            format!("must be at least {} characters", MIN_PASSWORD_LENGTH),
        ));
    }
    if len > MAX_PASSWORD_LENGTH {
        return Err(BoardError::validation(
            "password",
            format!("cannot exceed {} characters", MAX_PASSWORD_LENGTH),
        ));
    }
    Ok(())
}

/// Validate a color string: `#RGB` or `#RRGGBB`.
pub fn validate_color(color: &str) -> BoardResult<()> {
    let hex = color.strip_prefix('#').ok_or_else(|| {
        BoardError::validation("color", format!("must start with '#', got '{}'", color))
    })?;

    if !(hex.len() == 3 || hex.len() == 6) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BoardError::validation(
            "color",
            format!("must be #RGB or #RRGGBB, got '{}'", color),
        ));
    }
    Ok(())
}

fn validate_coordinate(value: f64, field: &str) -> BoardResult<()> {
    if !value.is_finite() {
        return Err(BoardError::validation(field, "must be a finite number"));
    }
    Ok(())
}

fn validate_dimension(value: f64, field: &str) -> BoardResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(BoardError::validation(
            field,
            format!("must be a positive number, got {}", value),
        ));
    }
    Ok(())
}

/// Validate a full property bag.
pub fn validate_properties(props: &NoteProperties) -> BoardResult<()> {
    validate_coordinate(props.x, "x")?;
    validate_coordinate(props.y, "y")?;
    validate_dimension(props.width, "width")?;
    validate_dimension(props.height, "height")?;
    validate_color(&props.color)
}

/// Validate the fields present in a partial property update.
pub fn validate_properties_patch(patch: &PropertiesPatch) -> BoardResult<()> {
    if let Some(x) = patch.x {
        validate_coordinate(x, "x")?;
    }
    if let Some(y) = patch.y {
        validate_coordinate(y, "y")?;
    }
    if let Some(w) = patch.width {
        validate_dimension(w, "width")?;
    }
    if let Some(h) = patch.height {
        validate_dimension(h, "height")?;
    }
    if let Some(color) = &patch.color {
        validate_color(color)?;
    }
    Ok(())
}
