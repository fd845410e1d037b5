//! Colour labels referenced by domains.

use qubesd_common::{QubesError, QubesResult};

/// A named display colour. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub index: u32,
    /// `0xRRGGBB`
    pub color: String,
    pub name: String,
}

impl Label {
    pub fn new(index: u32, color: &str, name: &str) -> QubesResult<Self> {
        validate_color(color)?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase()) {
            return Err(QubesError::invalid_value(format!(
                "invalid label name: {:?}",
                name
            )));
        }
        Ok(Self {
            index,
            color: color.to_string(),
            name: name.to_string(),
        })
    }
}

fn validate_color(color: &str) -> QubesResult<()> {
    let hex = color
        .strip_prefix("0x")
        .ok_or_else(|| QubesError::invalid_value(format!("invalid color: {:?}", color)))?;
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(QubesError::invalid_value(format!(
            "invalid color: {:?}",
            color
        )));
    }
    Ok(())
}

/// The eight stock labels present in a fresh store.
pub fn default_labels() -> Vec<Label> {
    [
        (1, "0xcc0000", "red"),
        (2, "0xf57900", "orange"),
        (3, "0xedd400", "yellow"),
        (4, "0x73d216", "green"),
        (5, "0x555753", "gray"),
        (6, "0x3465a4", "blue"),
        (7, "0x75507b", "purple"),
        (8, "0x000000", "black"),
    ]
    .into_iter()
    .map(|(index, color, name)| Label {
        index,
        color: color.to_string(),
        name: name.to_string(),
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_labels() {
        let labels = default_labels();
        assert_eq!(labels.len(), 8);
        assert_eq!(labels[0].name, "red");
        assert_eq!(labels[7].index, 8);
    }

    #[test]
    fn color_validation() {
        assert!(Label::new(9, "0xabcdef", "cyan").is_ok());
        assert!(Label::new(9, "abcdef", "cyan").is_err());
        assert!(Label::new(9, "0xabcd", "cyan").is_err());
        assert!(Label::new(9, "0xabcdef", "Cyan").is_err());
    }
}
