//! Access mode of a device node as understood by the devices controller.
use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags::bitflags! {
    /// Set of `r`ead, `w`rite and `m`knod permissions.
    ///
    /// A mode is [compatible](Mode::compatible) with another mode if it grants
    /// at least the same permissions. Subset inclusion is transitive, so a
    /// device that is compatible with its parent group is also compatible
    /// with every group above it, as long as each link holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mode: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const MKNOD = 0b100;
    }
}

const LETTERS: [(Mode, char); 3] = [(Mode::READ, 'r'), (Mode::WRITE, 'w'), (Mode::MKNOD, 'm')];

impl Mode {
    /// Returns true if `requested` is a subset of this mode
    pub fn compatible(&self, requested: Mode) -> bool {
        self.contains(requested)
    }

    /// Computes which permissions have to be taken away and which have to be
    /// granted to get from `self` to `new`, in this order.
    pub fn diff(&self, new: Mode) -> (Mode, Mode) {
        (self.difference(new), new.difference(*self))
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid access mode {mode:?}: unexpected character {invalid:?}")]
pub struct ParseModeError {
    mode: String,
    invalid: char,
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mode = Mode::empty();

        for c in s.chars() {
            match LETTERS.iter().find(|(_, letter)| *letter == c) {
                Some((bit, _)) => mode |= *bit,
                None => {
                    return Err(ParseModeError {
                        mode: s.to_owned(),
                        invalid: c,
                    })
                }
            }
        }

        Ok(mode)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (bit, letter) in LETTERS {
            if self.contains(bit) {
                write!(f, "{letter}")?;
            }
        }

        Ok(())
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
