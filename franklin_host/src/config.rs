//! JSON description of a simulated machine

use anyhow::{anyhow, bail, Context, Result};
use franklin::hal::{Adc, Pin, Pins};
use franklin::kinematics::{kind, Kinematics, MotorRef, Tower};
use franklin::space::{Axis, Motor, Space};
use franklin::store::Store;
use franklin::temp::Temp;
use franklin::{LinkConfig, Machine};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    #[serde(default)]
    pub spaces: Vec<SpaceConfig>,
    #[serde(default)]
    pub temps: Vec<TempConfig>,
    #[serde(default)]
    pub link: LinkTuning,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceConfig {
    #[serde(flatten)]
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometryConfig {
    Cartesian,
    Delta {
        /// Angle of the first tower in degrees
        #[serde(default)]
        angle: f64,
        towers: Option<[TowerConfig; 3]>,
    },
    Polar {
        max_r: Option<f64>,
    },
    Hbot,
    Drawbot {
        left: Option<[f64; 2]>,
        right: Option<[f64; 2]>,
    },
    Extruder {
        #[serde(default)]
        offsets: Vec<[f64; 3]>,
    },
    Follower {
        leaders: Vec<LeaderConfig>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TowerConfig {
    pub rodlength: f64,
    pub radius: f64,
    pub axis_min: Option<f64>,
    pub axis_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LeaderConfig {
    pub space: u8,
    pub motor: u8,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisConfig {
    #[serde(default)]
    pub offset: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A pin number, optionally inverted: `12` or `{ "pin": 12, "inverted": true }`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum PinConfig {
    Number(u8),
    Full {
        pin: u8,
        #[serde(default)]
        inverted: bool,
    },
}

impl From<PinConfig> for Pin {
    fn from(p: PinConfig) -> Self {
        match p {
            PinConfig::Number(n) => Pin::new(n, false),
            PinConfig::Full { pin, inverted } => Pin::new(pin, inverted),
        }
    }
}

fn pin(p: Option<PinConfig>) -> Pin {
    p.map(Pin::from).unwrap_or(Pin::NONE)
}

fn or_nan(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotorConfig {
    pub step: Option<PinConfig>,
    pub dir: Option<PinConfig>,
    pub enable: Option<PinConfig>,
    pub limit_min: Option<PinConfig>,
    pub limit_max: Option<PinConfig>,
    pub sense: Option<PinConfig>,
    pub steps_per_unit: Option<f64>,
    pub max_v: Option<f64>,
}

impl MotorConfig {
    fn motor(&self) -> Motor {
        let default = Motor::default();
        Motor {
            step: pin(self.step),
            dir: pin(self.dir),
            enable: pin(self.enable),
            limit_min: pin(self.limit_min),
            limit_max: pin(self.limit_max),
            sense: pin(self.sense),
            steps_per_unit: self.steps_per_unit.unwrap_or(default.steps_per_unit),
            max_v: self.max_v.unwrap_or(default.max_v),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TempConfig {
    pub power: Option<PinConfig>,
    pub thermistor: Option<PinConfig>,
    pub beta: Option<f64>,
    pub t0: Option<f64>,
    pub adc0: Option<f64>,
}

impl TempConfig {
    fn temp(&self) -> Temp {
        let default = Temp::default();
        Temp {
            power_pin: pin(self.power),
            thermistor_pin: pin(self.thermistor),
            beta: self.beta.unwrap_or(default.beta),
            t0: self.t0.unwrap_or(default.t0),
            adc0: self.adc0.unwrap_or(default.adc0),
            ..default
        }
    }
}

/// Link timing overrides, defaulting to the firmware's values
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkTuning {
    pub rx_timeout_us: u32,
    pub resend_timeout_us: u32,
    pub max_retries: u8,
}

impl Default for LinkTuning {
    fn default() -> Self {
        let LinkConfig {
            rx_timeout_us,
            resend_timeout_us,
            max_retries,
        } = LinkConfig::default();
        LinkTuning {
            rx_timeout_us,
            resend_timeout_us,
            max_retries,
        }
    }
}

impl From<LinkTuning> for LinkConfig {
    fn from(t: LinkTuning) -> Self {
        LinkConfig {
            rx_timeout_us: t.rx_timeout_us,
            resend_timeout_us: t.resend_timeout_us,
            max_retries: t.max_retries,
        }
    }
}

impl SpaceConfig {
    fn kind(&self) -> u8 {
        match self.geometry {
            GeometryConfig::Cartesian => kind::CARTESIAN,
            GeometryConfig::Delta { .. } => kind::DELTA,
            GeometryConfig::Polar { .. } => kind::POLAR,
            GeometryConfig::Hbot => kind::HBOT,
            GeometryConfig::Drawbot { .. } => kind::DRAWBOT,
            GeometryConfig::Extruder { .. } => kind::EXTRUDER,
            GeometryConfig::Follower { .. } => kind::FOLLOWER,
        }
    }

    pub fn space(&self) -> Result<Space> {
        let (axes, motors) = (self.axes.len(), self.motors.len());
        let mut space = Space::new(self.kind(), axes, motors).map_err(|_| {
            anyhow!("{axes} axes and {motors} motors do not fit {:?}", self.geometry)
        })?;

        match (&self.geometry, &mut space.kinematics) {
            (GeometryConfig::Delta { angle, towers }, Kinematics::Delta(delta)) => {
                delta.angle = *angle;
                if let Some(towers) = towers {
                    for (tower, config) in delta.towers.iter_mut().zip(towers) {
                        *tower = Tower {
                            rodlength: config.rodlength,
                            radius: config.radius,
                            axis_min: or_nan(config.axis_min),
                            axis_max: or_nan(config.axis_max),
                        };
                    }
                }
            }
            (GeometryConfig::Polar { max_r }, Kinematics::Polar(polar)) => {
                polar.max_r = or_nan(*max_r);
            }
            (GeometryConfig::Drawbot { left, right }, Kinematics::Drawbot(drawbot)) => {
                if let Some(left) = left {
                    drawbot.left = *left;
                }
                if let Some(right) = right {
                    drawbot.right = *right;
                }
            }
            (GeometryConfig::Extruder { offsets }, Kinematics::Extruder(extruder)) => {
                if offsets.len() > extruder.count() {
                    bail!("{} offsets for {} extruders", offsets.len(), extruder.count());
                }
                for (i, offset) in offsets.iter().enumerate() {
                    extruder.set_offset(i, *offset);
                }
            }
            (GeometryConfig::Follower { leaders }, Kinematics::Follower(follower)) => {
                if leaders.len() != self.motors.len() {
                    bail!("{} leaders for {} motors", leaders.len(), self.motors.len());
                }
                for (i, l) in leaders.iter().enumerate() {
                    follower.set_leader(
                        i,
                        MotorRef {
                            space: l.space,
                            motor: l.motor,
                        },
                    );
                }
            }
            _ => {}
        }

        for (axis, config) in space.axes.iter_mut().zip(&self.axes) {
            *axis = Axis {
                offset: config.offset,
                min: or_nan(config.min),
                max: or_nan(config.max),
                ..Axis::default()
            };
        }
        for (motor, config) in space.motors.iter_mut().zip(&self.motors) {
            *motor = config.motor();
        }
        Ok(space)
    }
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid machine description {}", path.display()))
    }

    /// Builds the machine with every space and temp of the description
    pub fn build<P: Pins, A: Adc, S: Store>(
        &self,
        pins: P,
        adc: A,
        store: S,
    ) -> Result<Machine<P, A, S>> {
        let mut machine = Machine::new(pins, adc, store);
        for (i, config) in self.spaces.iter().enumerate() {
            let space = config.space().with_context(|| format!("space {i}"))?;
            if machine.add_space(space).is_err() {
                bail!("space {i}: no room left for its motors");
            }
        }
        for (i, config) in self.temps.iter().enumerate() {
            if machine.add_temp(config.temp()).is_err() {
                bail!("temp {i}: too many temps");
            }
        }
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use franklin::sim::{SimAdc, SimPins};
    use franklin::store::MemoryStore;
    use std::io::Write;

    const PRINTER: &str = include_str!("../machines/printer.json");

    #[test]
    fn bundled_printer_builds() {
        let config: MachineConfig = serde_json::from_str(PRINTER).unwrap();
        let machine = config
            .build(SimPins::new(), SimAdc::new(), MemoryStore::<1024>::new())
            .unwrap();

        let spaces = machine.spaces();
        assert_eq!(spaces.len(), 2);
        assert_eq!(spaces[0].kinematics.kind(), kind::CARTESIAN);
        assert_eq!(spaces[0].axes.len(), 3);
        assert_eq!(spaces[0].axes[0].max, 200.);
        assert!(spaces[0].axes[0].offset == 0.);
        assert_eq!(spaces[0].motors[0].enable, Pin::new(4, true));
        assert_eq!(spaces[0].motors[2].steps_per_unit, 400.);
        assert!(spaces[0].motors[0].max_v.is_nan());
        assert_eq!(spaces[1].kinematics.kind(), kind::EXTRUDER);
        assert_eq!(machine.temps().len(), 1);
        assert_eq!(machine.temps()[0].beta, 3950.);
    }

    #[test]
    fn geometry_parameters_reach_the_kinematics() {
        let config: MachineConfig = serde_json::from_str(
            r#"{
                "spaces": [{
                    "kind": "delta",
                    "angle": 90,
                    "towers": [
                        { "rodlength": 200, "radius": 100 },
                        { "rodlength": 200, "radius": 100 },
                        { "rodlength": 200, "radius": 100, "axis_max": 150 }
                    ],
                    "axes": [{}, {}, {}],
                    "motors": [{ "step": 1 }, { "step": 5 }, { "step": 9 }]
                }, {
                    "kind": "follower",
                    "leaders": [{ "space": 0, "motor": 2 }],
                    "motors": [{ "step": { "pin": 13, "inverted": true } }]
                }],
                "link": { "max_retries": 9 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.link.max_retries, 9);
        assert_eq!(config.link.resend_timeout_us, 20_000);

        let delta = config.spaces[0].space().unwrap();
        match delta.kinematics {
            Kinematics::Delta(d) => {
                assert_eq!(d.angle, 90.);
                assert_eq!(d.towers[2].axis_max, 150.);
                assert!(d.towers[0].axis_max.is_nan());
                assert_eq!(d.towers[1].rodlength, 200.);
            }
            other => panic!("unexpected {other:?}"),
        }
        let follower = config.spaces[1].space().unwrap();
        assert!(follower.is_follower());
        assert_eq!(follower.motors[0].step, Pin::new(13, true));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let config: MachineConfig = serde_json::from_str(
            r#"{ "spaces": [{ "kind": "delta", "axes": [{}, {}], "motors": [{}, {}] }] }"#,
        )
        .unwrap();
        let err = config
            .build(SimPins::new(), SimAdc::new(), MemoryStore::<64>::new())
            .err()
            .unwrap();
        assert!(format!("{err:#}").starts_with("space 0"));

        let bad = serde_json::from_str::<MachineConfig>(r#"{ "spaces": [{ "kind": "scara" }] }"#);
        assert!(bad.is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PRINTER.as_bytes()).unwrap();
        let config = MachineConfig::load(file.path()).unwrap();
        assert_eq!(config.spaces.len(), 2);

        assert!(MachineConfig::load(Path::new("/nonexistent/machine.json")).is_err());
    }
}
