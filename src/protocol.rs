//! Register data model and value codec for the KWB Modbus register space.
//!
//! A [`RegisterDefinition`] describes one addressable register of the boiler:
//! where it lives, how wide it is, which function codes reach it, who may
//! write it and how its raw words translate into a typed value. Definitions
//! are produced by the catalog builder and are immutable afterwards.
//!
//! The codec half of this module is pure: [`RegisterDefinition::decode`] and
//! [`RegisterDefinition::encode`] convert between raw register words and
//! [`Value`]s without touching any I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Access tiers of the KWB service menu. `User < Expert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum AccessLevel {
    #[serde(rename = "user", alias = "UserLevel")]
    User,
    #[serde(rename = "expert", alias = "ExpertLevel")]
    Expert,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::User => write!(f, "user"),
            AccessLevel::Expert => write!(f, "expert"),
        }
    }
}

/// What one access-level column of a register document grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    None,
    Read,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        !matches!(self, Access::None)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Width and signedness of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DataType {
    #[serde(rename = "u16")]
    U16,
    #[serde(rename = "s16")]
    S16,
    #[serde(rename = "u32")]
    U32,
    #[serde(rename = "s32")]
    S32,
}

impl DataType {
    /// Number of 16-bit register words occupied on the wire.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::S16 => 1,
            DataType::U32 | DataType::S32 => 2,
        }
    }

    /// Inclusive representable range of the raw integer.
    pub fn bounds(self) -> (i64, i64) {
        match self {
            DataType::U16 => (0, u16::MAX as i64),
            DataType::S16 => (i16::MIN as i64, i16::MAX as i64),
            DataType::U32 => (0, u32::MAX as i64),
            DataType::S32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }

    /// Combine register words into a raw integer. 32-bit values are stored
    /// most-significant word first.
    pub fn raw_from_words(self, words: &[u16]) -> Option<i64> {
        match (self, words) {
            (DataType::U16, [w]) => Some(*w as i64),
            (DataType::S16, [w]) => Some(*w as i16 as i64),
            (DataType::U32, [hi, lo]) => Some((((*hi as u32) << 16) | *lo as u32) as i64),
            (DataType::S32, [hi, lo]) => Some((((*hi as u32) << 16) | *lo as u32) as i32 as i64),
            _ => None,
        }
    }

    /// Split a raw integer into register words, most-significant word first.
    ///
    /// The caller must have range-checked `raw` against [`Self::bounds`].
    pub fn raw_to_words(self, raw: i64) -> Vec<u16> {
        match self {
            DataType::U16 | DataType::S16 => vec![raw as u16],
            DataType::U32 | DataType::S32 => {
                let v = raw as u32;
                vec![(v >> 16) as u16, v as u16]
            }
        }
    }
}

/// Which read function codes a register answers to.
///
/// KWB boilers expose most live values as input registers (FC 04) and
/// parameters as holding registers (FC 03); a number of registers answer to
/// both. The transport client resolves `Either` at runtime, trying FC 04
/// first (the documented preference for this device family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum ReadClass {
    #[serde(rename = "04")]
    Input,
    #[serde(rename = "03")]
    Holding,
    #[serde(rename = "03/04")]
    Either,
}

/// A concrete Modbus read function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadFunction {
    /// FC 04
    InputRegisters,
    /// FC 03
    HoldingRegisters,
}

impl ReadClass {
    /// Candidate function codes in discovery priority order.
    pub fn candidates(self) -> &'static [ReadFunction] {
        match self {
            ReadClass::Input => &[ReadFunction::InputRegisters],
            ReadClass::Holding => &[ReadFunction::HoldingRegisters],
            ReadClass::Either => &[ReadFunction::InputRegisters, ReadFunction::HoldingRegisters],
        }
    }
}

impl fmt::Display for ReadFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFunction::InputRegisters => write!(f, "FC04"),
            ReadFunction::HoldingRegisters => write!(f, "FC03"),
        }
    }
}

/// How raw register content maps onto a display value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSpec {
    /// Plain integer without a unit.
    Raw,
    /// `1/<divisor><unit>` decimal scaling; `divisor` 1 for unscaled units.
    Scaled { divisor: u32, unit: String },
    /// Lookup through a named value table.
    Table(String),
}

impl ValueSpec {
    /// Parse the `unit_value_table` field of a register document.
    ///
    /// The field overloads three meanings: empty (raw), a scaling unit such
    /// as `1/10°C` or a plain `%`, or the name of a value table. Table names
    /// win, matching how the original register documents are resolved.
    pub fn parse(field: &str, tables: &ValueTables) -> ValueSpec {
        if field.is_empty() {
            return ValueSpec::Raw;
        }
        if tables.contains(field) {
            return ValueSpec::Table(field.to_string());
        }
        if let Some(rest) = field.strip_prefix("1/") {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(divisor) = digits.parse::<u32>() {
                if divisor > 0 {
                    let unit = rest[digits.len()..].to_string();
                    return ValueSpec::Scaled { divisor, unit };
                }
            }
        }
        ValueSpec::Scaled {
            divisor: 1,
            unit: field.to_string(),
        }
    }

    /// Display unit, if any.
    pub fn unit(&self) -> Option<&str> {
        match self {
            ValueSpec::Scaled { unit, .. } if !unit.is_empty() => Some(unit),
            _ => None,
        }
    }
}

/// Repeatable hardware subsystems of a KWB heating installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentCategory {
    HeatingCircuit,
    BufferStorage,
    DhwStorage,
    SecondaryHeatSource,
    Circulation,
    Solar,
    BoilerSequence,
    HeatMeter,
}

impl EquipmentCategory {
    pub const ALL: [EquipmentCategory; 8] = [
        EquipmentCategory::HeatingCircuit,
        EquipmentCategory::BufferStorage,
        EquipmentCategory::DhwStorage,
        EquipmentCategory::SecondaryHeatSource,
        EquipmentCategory::Circulation,
        EquipmentCategory::Solar,
        EquipmentCategory::BoilerSequence,
        EquipmentCategory::HeatMeter,
    ];

    /// Identifier stem used in register ids and document file names.
    pub fn slug(self) -> &'static str {
        match self {
            EquipmentCategory::HeatingCircuit => "heating_circuit",
            EquipmentCategory::BufferStorage => "buffer_storage",
            EquipmentCategory::DhwStorage => "dhw_storage",
            EquipmentCategory::SecondaryHeatSource => "secondary_heat_source",
            EquipmentCategory::Circulation => "circulation",
            EquipmentCategory::Solar => "solar",
            EquipmentCategory::BoilerSequence => "boiler_sequence",
            EquipmentCategory::HeatMeter => "heat_meter",
        }
    }
}

impl fmt::Display for EquipmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Provenance of an equipment-expanded register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EquipmentInstance {
    pub category: EquipmentCategory,
    /// 1-based instance number.
    pub instance: u8,
}

/// A fully resolved register of the device's Modbus address space.
///
/// Instances are produced by the catalog builder and never mutated. The
/// `writable` flag already folds in the configured access level: a register
/// whose required level exceeds the configured one is kept for reading but
/// degraded to read-only exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDefinition {
    /// Stable identifier, unique within a catalog.
    pub id: String,
    /// Human-readable name from the definition document.
    pub name: String,
    /// 0-based register address.
    pub address: u16,
    pub data_type: DataType,
    pub read: ReadClass,
    /// Lowest access level that may write, if the register is writable at all.
    pub write_level: Option<AccessLevel>,
    /// Write exposure resolved against the configured access level.
    pub writable: bool,
    pub value_spec: ValueSpec,
    /// Declared bounds in display units.
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub equipment: Option<EquipmentInstance>,
}

/// Raw-code-to-text mapping used for enumerated registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ValueTable(pub BTreeMap<u16, String>);

/// Texts recognized as boolean off/on pairs, lowercase, off first.
const BOOLEAN_PAIRS: [(&str, &str); 2] = [("off", "on"), ("aus", "ein")];

impl ValueTable {
    pub fn lookup(&self, code: u16) -> Option<&str> {
        self.0.get(&code).map(String::as_str)
    }

    pub fn reverse_lookup(&self, text: &str) -> Option<u16> {
        self.0
            .iter()
            .find(|(_, v)| v.as_str() == text)
            .map(|(k, _)| *k)
    }

    /// Detect a boolean table: exactly two entries whose texts carry off/on
    /// semantics. Returns `(off_code, on_code)`.
    pub fn as_boolean(&self) -> Option<(u16, u16)> {
        if self.0.len() != 2 {
            return None;
        }
        let entries: Vec<(u16, String)> =
            self.0.iter().map(|(k, v)| (*k, v.to_lowercase())).collect();
        for (off, on) in BOOLEAN_PAIRS {
            let off_code = entries
                .iter()
                .find(|(_, v)| v.as_str() == off)
                .map(|(k, _)| *k);
            let on_code = entries
                .iter()
                .find(|(_, v)| v.as_str() == on)
                .map(|(k, _)| *k);
            if let (Some(off_code), Some(on_code)) = (off_code, on_code) {
                return Some((off_code, on_code));
            }
        }
        None
    }
}

/// All value tables of one definition document set, keyed by table name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ValueTables(pub BTreeMap<String, ValueTable>);

impl ValueTables {
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ValueTable> {
        self.0.get(name)
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Result of a decode: the display value plus the undecoded raw integer.
///
/// Both halves are always available so diagnostic surfaces can expose the
/// raw register content next to the decoded reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    pub raw: i64,
}

/// Codec failures. Each failure concerns a single register and never aborts
/// the surrounding poll cycle.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("register {id}: expected {expected} register word(s), got {got}")]
    WordCount {
        id: String,
        expected: u16,
        got: usize,
    },

    #[error("register {id}: raw code {code} not in value table '{table}'")]
    UnknownCode { id: String, table: String, code: i64 },

    #[error("register {id}: value table '{table}' is not defined")]
    MissingTable { id: String, table: String },

    #[error("register {id}: value {value} out of range {min}..={max}")]
    OutOfRange {
        id: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("register {id}: cannot encode '{value}' for this register kind")]
    IncompatibleValue { id: String, value: String },
}

impl RegisterDefinition {
    /// Decode raw register words into a typed value.
    pub fn decode(&self, words: &[u16], tables: &ValueTables) -> Result<Decoded, CodecError> {
        let raw =
            self.data_type
                .raw_from_words(words)
                .ok_or_else(|| CodecError::WordCount {
                    id: self.id.clone(),
                    expected: self.data_type.register_count(),
                    got: words.len(),
                })?;

        let value = match &self.value_spec {
            ValueSpec::Raw => Value::Integer(raw),
            ValueSpec::Scaled { divisor: 1, .. } => Value::Integer(raw),
            ValueSpec::Scaled { divisor, .. } => Value::Decimal(raw as f64 / *divisor as f64),
            ValueSpec::Table(name) => {
                let table = tables.get(name).ok_or_else(|| CodecError::MissingTable {
                    id: self.id.clone(),
                    table: name.clone(),
                })?;
                let code = u16::try_from(raw).ok();
                let text = code.and_then(|c| table.lookup(c)).ok_or_else(|| {
                    CodecError::UnknownCode {
                        id: self.id.clone(),
                        table: name.clone(),
                        code: raw,
                    }
                })?;
                match (table.as_boolean(), code) {
                    (Some((_, on_code)), Some(code)) => Value::Bool(code == on_code),
                    _ => Value::Text(text.to_string()),
                }
            }
        };

        Ok(Decoded { value, raw })
    }

    /// Encode a target value into raw register words.
    ///
    /// Fails with [`CodecError::OutOfRange`] when the target lies outside the
    /// declared min/max or outside the data type's representable range.
    pub fn encode(&self, target: &Value, tables: &ValueTables) -> Result<Vec<u16>, CodecError> {
        let raw = match (&self.value_spec, target) {
            (ValueSpec::Table(name), target) => {
                let table = tables.get(name).ok_or_else(|| CodecError::MissingTable {
                    id: self.id.clone(),
                    table: name.clone(),
                })?;
                let code = match target {
                    Value::Bool(state) => table.as_boolean().map(|(off_code, on_code)| {
                        if *state {
                            on_code
                        } else {
                            off_code
                        }
                    }),
                    Value::Text(text) => table.reverse_lookup(text),
                    Value::Integer(raw) => u16::try_from(*raw)
                        .ok()
                        .filter(|code| table.lookup(*code).is_some()),
                    Value::Decimal(_) => None,
                };
                code.ok_or_else(|| CodecError::IncompatibleValue {
                    id: self.id.clone(),
                    value: target.to_string(),
                })? as i64
            }
            (ValueSpec::Scaled { divisor, .. }, target) if *divisor > 1 => {
                let display = match target {
                    Value::Decimal(v) => *v,
                    Value::Integer(v) => *v as f64,
                    other => {
                        return Err(CodecError::IncompatibleValue {
                            id: self.id.clone(),
                            value: other.to_string(),
                        });
                    }
                };
                self.check_declared_range(display)?;
                (display * *divisor as f64).round() as i64
            }
            (_, Value::Integer(raw)) => {
                self.check_declared_range(*raw as f64)?;
                *raw
            }
            (_, Value::Decimal(v)) if v.fract() == 0.0 => {
                self.check_declared_range(*v)?;
                *v as i64
            }
            (_, other) => {
                return Err(CodecError::IncompatibleValue {
                    id: self.id.clone(),
                    value: other.to_string(),
                });
            }
        };

        let (lo, hi) = self.data_type.bounds();
        if raw < lo || raw > hi {
            return Err(CodecError::OutOfRange {
                id: self.id.clone(),
                value: raw as f64,
                min: lo as f64,
                max: hi as f64,
            });
        }
        Ok(self.data_type.raw_to_words(raw))
    }

    fn check_declared_range(&self, display: f64) -> Result<(), CodecError> {
        let min = self.min.unwrap_or(f64::NEG_INFINITY);
        let max = self.max.unwrap_or(f64::INFINITY);
        if display < min || display > max {
            return Err(CodecError::OutOfRange {
                id: self.id.clone(),
                value: display,
                min,
                max,
            });
        }
        Ok(())
    }
}
