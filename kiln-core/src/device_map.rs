use std::fmt;
use std::str::FromStr;

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

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => f.write_str("cpu"),
            Self::Ordinal(ordinal) => write!(f, "auto:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu`, `auto`, `cuda`, `gpu`, `metal`, `cuda:N`, `metal:N`,
    /// `auto:N` or a bare ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => return Ok(Self::ForceCpu),
            "" | "auto" | "cuda" | "gpu" | "metal" => return Ok(Self::Ordinal(0)),
            _ => {}
        }
        let ordinal = match value.split_once(':') {
            Some(("cuda" | "gpu" | "metal" | "auto", ordinal)) => ordinal,
            Some(_) => return Err(format!("unknown device '{s}'")),
            None => value.as_str(),
        };
        ordinal
            .parse()
            .map(Self::Ordinal)
            .map_err(|_| format!("invalid device ordinal in '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_selectors() {
        assert_eq!("cpu".parse::<DeviceMap>(), Ok(DeviceMap::ForceCpu));
        assert_eq!("CUDA".parse::<DeviceMap>(), Ok(DeviceMap::Ordinal(0)));
        assert_eq!("cuda:1".parse::<DeviceMap>(), Ok(DeviceMap::Ordinal(1)));
        assert_eq!("metal:0".parse::<DeviceMap>(), Ok(DeviceMap::Ordinal(0)));
        assert_eq!("2".parse::<DeviceMap>(), Ok(DeviceMap::Ordinal(2)));
        assert!("tpu:0".parse::<DeviceMap>().is_err());
        assert!("cuda:x".parse::<DeviceMap>().is_err());
    }
}
