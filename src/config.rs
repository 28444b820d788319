//! VM resource shapes and the sizing-profile merge lattice (spec.md §4.1
//! step 1, §9 "Configuration layering").
//!
//! Two named merges compose the final shape for each role:
//!
//! - `defaults_from`: adopts the argument's field only where the receiver's
//!   field is the type's zero value.
//! - `override_by`: adopts the argument's field wherever the argument's
//!   field is non-zero.
//!
//! Implementers must apply `defaults_from` then `override_by`, in that
//! order, for plan determinism (§8) — the merges are not commutative with
//! each other, only each is idempotent with itself.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct VMConfig {
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub ram_mb: u32,
    #[serde(default)]
    pub disk_gb: u32,
}

impl VMConfig {
    fn defaults_from(self, other: VMConfig) -> VMConfig {
        VMConfig {
            cpu: if self.cpu == 0 { other.cpu } else { self.cpu },
            ram_mb: if self.ram_mb == 0 { other.ram_mb } else { self.ram_mb },
            disk_gb: if self.disk_gb == 0 { other.disk_gb } else { self.disk_gb },
        }
    }

    fn override_by(self, other: VMConfig) -> VMConfig {
        VMConfig {
            cpu: if other.cpu != 0 { other.cpu } else { self.cpu },
            ram_mb: if other.ram_mb != 0 { other.ram_mb } else { self.ram_mb },
            disk_gb: if other.disk_gb != 0 { other.disk_gb } else { self.disk_gb },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleShapes {
    pub control: VMConfig,
    pub server: VMConfig,
    pub switch: VMConfig,
}

impl RoleShapes {
    fn defaults_from(self, other: RoleShapes) -> RoleShapes {
        RoleShapes {
            control: self.control.defaults_from(other.control),
            server: self.server.defaults_from(other.server),
            switch: self.switch.defaults_from(other.switch),
        }
    }

    fn override_by(self, other: RoleShapes) -> RoleShapes {
        RoleShapes {
            control: self.control.override_by(other.control),
            server: self.server.override_by(other.server),
            switch: self.switch.override_by(other.switch),
        }
    }
}

/// One of the four named sizing profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Default,
    Compact,
    Full,
    Huge,
}

impl std::str::FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Profile::Default),
            "compact" => Ok(Profile::Compact),
            "full" => Ok(Profile::Full),
            "huge" => Ok(Profile::Huge),
            other => anyhow::bail!("unknown sizing profile {other:?}"),
        }
    }
}

/// Optional per-role overrides a wiring file's embedded VLAB config block
/// may carry, applied on top of the built-in profile the operator selected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizingOverrides {
    #[serde(default)]
    pub control: VMConfig,
    #[serde(default)]
    pub server: VMConfig,
    #[serde(default)]
    pub switch: VMConfig,
}

impl SizingOverrides {
    fn as_shapes(&self) -> RoleShapes {
        RoleShapes {
            control: self.control,
            server: self.server,
            switch: self.switch,
        }
    }
}

const GLOBAL_DEFAULT: RoleShapes = RoleShapes {
    control: VMConfig { cpu: 4, ram_mb: 8192, disk_gb: 100 },
    server: VMConfig { cpu: 2, ram_mb: 4096, disk_gb: 50 },
    switch: VMConfig { cpu: 2, ram_mb: 2048, disk_gb: 20 },
};

fn builtin_profile_shape(profile: Profile) -> RoleShapes {
    match profile {
        Profile::Default => GLOBAL_DEFAULT,
        Profile::Compact => RoleShapes {
            control: VMConfig { cpu: 2, ram_mb: 4096, disk_gb: 50 },
            server: VMConfig { cpu: 1, ram_mb: 2048, disk_gb: 30 },
            switch: VMConfig { cpu: 1, ram_mb: 1024, disk_gb: 10 },
        },
        Profile::Full => RoleShapes {
            control: VMConfig { cpu: 6, ram_mb: 16384, disk_gb: 150 },
            server: VMConfig { cpu: 4, ram_mb: 8192, disk_gb: 80 },
            switch: VMConfig { cpu: 2, ram_mb: 4096, disk_gb: 30 },
        },
        Profile::Huge => RoleShapes {
            control: VMConfig { cpu: 8, ram_mb: 32768, disk_gb: 300 },
            server: VMConfig { cpu: 8, ram_mb: 16384, disk_gb: 150 },
            switch: VMConfig { cpu: 4, ram_mb: 8192, disk_gb: 50 },
        },
    }
}

/// Merges the global default shape, the built-in profile shape, and any
/// wiring-embedded override, in the order spec.md §4.1 step 1 requires:
/// `global default .defaults_from(builtin default profile) .override_by(selected profile) .override_by(wiring overrides)`.
pub fn resolve_shapes(profile: Profile, wiring_overrides: Option<&SizingOverrides>) -> RoleShapes {
    let mut shapes = GLOBAL_DEFAULT.defaults_from(builtin_profile_shape(Profile::Default));
    shapes = shapes.override_by(builtin_profile_shape(profile));
    if let Some(overrides) = wiring_overrides {
        shapes = shapes.override_by(overrides.as_shapes());
    }
    shapes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_only_fills_zeros() {
        let a = VMConfig { cpu: 2, ram_mb: 0, disk_gb: 10 };
        let b = VMConfig { cpu: 99, ram_mb: 99, disk_gb: 99 };
        let merged = a.defaults_from(b);
        assert_eq!(merged, VMConfig { cpu: 2, ram_mb: 99, disk_gb: 10 });
    }

    #[test]
    fn override_by_only_replaces_nonzero() {
        let a = VMConfig { cpu: 2, ram_mb: 4, disk_gb: 10 };
        let b = VMConfig { cpu: 0, ram_mb: 8, disk_gb: 0 };
        let merged = a.override_by(b);
        assert_eq!(merged, VMConfig { cpu: 2, ram_mb: 8, disk_gb: 10 });
    }

    #[test]
    fn resolve_shapes_is_deterministic() {
        let a = resolve_shapes(Profile::Compact, None);
        let b = resolve_shapes(Profile::Compact, None);
        assert_eq!(a.control, b.control);
        assert_eq!(a.server, b.server);
        assert_eq!(a.switch, b.switch);
    }

    #[test]
    fn wiring_overrides_win_over_profile() {
        let overrides = SizingOverrides {
            control: VMConfig { cpu: 99, ram_mb: 0, disk_gb: 0 },
            ..Default::default()
        };
        let shapes = resolve_shapes(Profile::Default, Some(&overrides));
        assert_eq!(shapes.control.cpu, 99);
        assert_eq!(shapes.control.ram_mb, GLOBAL_DEFAULT.control.ram_mb);
    }
}
