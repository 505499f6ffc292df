use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};

/// Where the model should live. Parsed from `cpu`, `cuda:N`, `metal:N` or a bare ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Self::ForceCpu);
        }
        let ordinal = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("metal:"))
            .unwrap_or(&s);
        ordinal
            .parse::<usize>()
            .map(Self::Ordinal)
            .map_err(|_| anyhow!("invalid device `{s}`, expected `cpu`, `cuda:N`, `metal:N` or N"))
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("cpu".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu);
        assert_eq!("CUDA:1".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(1));
        assert_eq!("metal:0".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(0));
        assert_eq!("2".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(2));
        assert!("tpu".parse::<DeviceMap>().is_err());
    }
}
