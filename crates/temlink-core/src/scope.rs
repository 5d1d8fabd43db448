//! Optics state: magnification modes, lookup tables and the focus/brightness cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Function-mode indices at or above this value are low-magnification modes.
pub const LOW_MAG_FUNCTION_MODE: u8 = 2;

// ============================================================================
// Magnification Modes
// ============================================================================

/// Magnification mode requested by a scope command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MagMode {
    #[default]
    #[serde(rename = "MAG1")]
    Mag1,
    #[serde(rename = "MAG2")]
    Mag2,
    #[serde(rename = "LM")]
    LowMag,
}

impl MagMode {
    /// Function-mode index the instrument expects for this mode.
    pub fn function_mode(&self) -> u8 {
        match self {
            Self::Mag1 => 0,
            Self::Mag2 => 1,
            Self::LowMag => LOW_MAG_FUNCTION_MODE,
        }
    }

    pub fn is_low_mag(&self) -> bool {
        matches!(self, Self::LowMag)
    }
}

impl fmt::Display for MagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mag1 => "MAG1",
            Self::Mag2 => "MAG2",
            Self::LowMag => "LM",
        };
        f.write_str(name)
    }
}

/// Two-valued mode label reported in scope status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedMagMode {
    #[serde(rename = "MAG")]
    Mag,
    #[serde(rename = "LM")]
    LowMag,
}

impl ReportedMagMode {
    /// Maps the instrument's function-mode index onto a label.
    pub fn from_function_mode(mode: u8) -> Self {
        if mode < LOW_MAG_FUNCTION_MODE {
            Self::Mag
        } else {
            Self::LowMag
        }
    }
}

// ============================================================================
// Screen
// ============================================================================

/// Viewing screen position. `Down` means the beam is blanked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenPosition {
    Up,
    Down,
}

impl ScreenPosition {
    pub fn from_beam_blank(blanked: bool) -> Self {
        if blanked {
            Self::Down
        } else {
            Self::Up
        }
    }

    pub fn is_blanked(&self) -> bool {
        matches!(self, Self::Down)
    }
}

// ============================================================================
// Magnification Tables
// ============================================================================

/// Ordered magnification table mapping a magnification value to its selector index.
///
/// The index of a value is its position in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnificationTable {
    entries: Vec<u32>,
    index: BTreeMap<u32, u32>,
}

impl MagnificationTable {
    /// Builds a table from ordered magnification values.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFieldValue` for an empty table or a
    /// repeated value.
    pub fn new(name: &str, entries: Vec<u32>) -> DomainResult<Self> {
        if entries.is_empty() {
            return Err(DomainError::invalid(name, "[]", "at least one magnification"));
        }

        let mut index = BTreeMap::new();
        for (position, value) in entries.iter().enumerate() {
            let position = u32::try_from(position)
                .map_err(|_| DomainError::invalid(name, entries.len(), "a shorter table"))?;
            if index.insert(*value, position).is_some() {
                return Err(DomainError::invalid(name, value, "unique magnifications"));
            }
        }

        Ok(Self { entries, index })
    }

    /// Selector index for `mag`, if the table contains it.
    pub fn index_of(&self, mag: u32) -> Option<u32> {
        self.index.get(&mag).copied()
    }

    /// Magnification at selector `index`.
    pub fn value_at(&self, index: u32) -> Option<u32> {
        self.entries.get(index as usize).copied()
    }

    pub fn values(&self) -> &[u32] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The standard and low-magnification tables, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnificationTables {
    standard: MagnificationTable,
    low: MagnificationTable,
}

impl MagnificationTables {
    pub fn new(standard: MagnificationTable, low: MagnificationTable) -> Self {
        Self { standard, low }
    }

    /// Table consulted for `mode`: low-mag for `LM`, standard otherwise.
    pub fn table_for(&self, mode: MagMode) -> &MagnificationTable {
        if mode.is_low_mag() {
            &self.low
        } else {
            &self.standard
        }
    }

    /// Resolves the selector index for `mag` in the table chosen by `mode`.
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidMagnification` if `mag` is not in that table.
    pub fn resolve(&self, mode: MagMode, mag: u32) -> DomainResult<u32> {
        self.table_for(mode)
            .index_of(mag)
            .ok_or(DomainError::InvalidMagnification { mode, mag })
    }

    /// Magnification shown at `selector` while the instrument is in `function_mode`.
    pub fn value_for(&self, function_mode: u8, selector: u32) -> Option<u32> {
        match ReportedMagMode::from_function_mode(function_mode) {
            ReportedMagMode::Mag => self.standard.value_at(selector),
            ReportedMagMode::LowMag => self.low.value_at(selector),
        }
    }

    pub fn standard(&self) -> &MagnificationTable {
        &self.standard
    }

    pub fn low(&self) -> &MagnificationTable {
        &self.low
    }
}

impl Default for MagnificationTables {
    fn default() -> Self {
        Self {
            standard: MagnificationTable {
                entries: vec![2000],
                index: BTreeMap::from([(2000, 0)]),
            },
            low: MagnificationTable {
                entries: vec![50],
                index: BTreeMap::from([(50, 0)]),
            },
        }
    }
}

// ============================================================================
// Scope State
// ============================================================================

/// Last confirmed absolute focus and brightness.
///
/// The instrument only accepts relative adjustments for these two values,
/// so the absolute value is remembered here and every new command is sent
/// as a delta against it. Only update after the hardware accepted a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeState {
    pub focus: i32,
    pub brightness: i32,
}

impl ScopeState {
    /// Delta to send so that focus ends up at `target`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFieldValue` when the delta does not fit an `i32`.
    pub fn focus_delta(&self, target: i32) -> DomainResult<i32> {
        delta("focus", self.focus, target)
    }

    /// Delta to send so that brightness ends up at `target`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFieldValue` when the delta does not fit an `i32`.
    pub fn brightness_delta(&self, target: i32) -> DomainResult<i32> {
        delta("brightness", self.brightness, target)
    }
}

fn delta(field: &str, current: i32, target: i32) -> DomainResult<i32> {
    target.checked_sub(current).ok_or_else(|| {
        DomainError::invalid(
            field,
            target,
            format!("a step from {current} that fits a 32-bit delta"),
        )
    })
}
