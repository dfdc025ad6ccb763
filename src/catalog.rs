//! Register catalog builder.
//!
//! KWB publishes its Modbus register layout as a set of definition documents
//! per firmware version and language: universal registers valid for every
//! boiler, device-model documents (which may declare a base model they
//! extend), equipment templates for repeatable subsystems such as heating
//! circuits, value tables and alarm codes. This module loads those documents
//! and resolves one configuration tuple — model, firmware version, language,
//! equipment counts, access level — into a flat, address-deduplicated
//! [`Catalog`] of [`RegisterDefinition`]s.
//!
//! Resolution is split in two stages: [`DefinitionSource`] performs the file
//! I/O, [`DefinitionDocuments::resolve`] is pure. The same input tuple always
//! yields a field-for-field identical catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::protocol::{
    Access, AccessLevel, DataType, EquipmentCategory, EquipmentInstance, ReadClass,
    RegisterDefinition, ValueSpec, ValueTables,
};

/// Fatal catalog-build failures. Unrecognized versions, models or equipment
/// configurations fail closed; there is no silent fallback to a default.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("firmware version '{0}' is not supported by the definition documents")]
    UnsupportedVersion(String),

    #[error("device model '{0}' is not known to this firmware version")]
    UnknownModel(String),

    #[error("device model '{model}' declares unknown base model '{base}'")]
    UnknownBaseModel { model: String, base: String },

    #[error("equipment {category}: {count} configured instances exceed the maximum of {max}")]
    TooManyInstances {
        category: EquipmentCategory,
        count: u8,
        max: u8,
    },

    #[error("cannot read definition document {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed definition document {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Known device models and their document file names.
///
/// The mapping is explicit rather than derived from the model name so that a
/// typo in the configuration fails with [`CatalogError::UnknownModel`]
/// instead of probing the filesystem.
const MODEL_FILES: [(&str, &str); 7] = [
    ("KWB Easyfire", "kwb_easyfire.json"),
    ("KWB Multifire", "kwb_multifire.json"),
    ("KWB Pelletfire+", "kwb_pelletfire_plus.json"),
    ("KWB Combifire", "kwb_combifire.json"),
    ("KWB CF 1", "kwb_cf1.json"),
    ("KWB CF 1.5", "kwb_cf1_5.json"),
    ("KWB CF 2", "kwb_cf2.json"),
];

fn model_file(model: &str) -> Option<&'static str> {
    MODEL_FILES
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, file)| *file)
}

/// One register row of a definition document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegisterEntry {
    pub starting_address: u16,
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "ReadClass::default_either")]
    pub function_codes: ReadClass,
    #[serde(default)]
    pub unit_value_table: String,
    #[serde(default)]
    pub user_level: String,
    #[serde(default)]
    pub expert_level: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ReadClass {
    fn default_either() -> ReadClass {
        ReadClass::Either
    }
}

/// A universal- or device-register document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterDoc {
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub registers: Vec<RegisterEntry>,
}

/// One register row of an equipment template, addressed relative to the
/// instance block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateEntry {
    pub address_offset: u16,
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "ReadClass::default_either")]
    pub function_codes: ReadClass,
    #[serde(default)]
    pub unit_value_table: String,
    #[serde(default)]
    pub user_level: String,
    #[serde(default)]
    pub expert_level: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// An equipment-category template document.
///
/// Address stride and the per-category instance maximum are data defined:
/// they differ between firmware versions and must never be hard-coded.
#[derive(Debug, Clone, Deserialize)]
pub struct EquipmentDoc {
    pub category: EquipmentCategory,
    /// Address where instance 1 starts.
    pub base_address: u16,
    /// Address distance between consecutive instances.
    pub stride: u16,
    pub max_instances: u8,
    #[serde(default)]
    pub registers: Vec<TemplateEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlarmCode {
    pub code: u16,
    pub text: String,
}

/// Per-category equipment instance counts of one installation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EquipmentCounts {
    #[serde(default)]
    pub heating_circuits: u8,
    #[serde(default)]
    pub buffer_storage: u8,
    #[serde(default)]
    pub dhw_storage: u8,
    #[serde(default)]
    pub secondary_heat_sources: u8,
    #[serde(default)]
    pub circulation: u8,
    #[serde(default)]
    pub solar: u8,
    #[serde(default)]
    pub boiler_sequence: u8,
    #[serde(default)]
    pub heat_meters: u8,
}

impl EquipmentCounts {
    pub fn get(&self, category: EquipmentCategory) -> u8 {
        match category {
            EquipmentCategory::HeatingCircuit => self.heating_circuits,
            EquipmentCategory::BufferStorage => self.buffer_storage,
            EquipmentCategory::DhwStorage => self.dhw_storage,
            EquipmentCategory::SecondaryHeatSource => self.secondary_heat_sources,
            EquipmentCategory::Circulation => self.circulation,
            EquipmentCategory::Solar => self.solar,
            EquipmentCategory::BoilerSequence => self.boiler_sequence,
            EquipmentCategory::HeatMeter => self.heat_meters,
        }
    }
}

/// The input tuple a catalog is resolved for.
#[derive(Debug, Clone)]
pub struct CatalogRequest {
    pub model: String,
    pub firmware_version: String,
    pub language: String,
    pub equipment: EquipmentCounts,
    pub access_level: AccessLevel,
}

/// The complete document set of one (version, language) combination, held in
/// memory. Resolution over this struct is pure and deterministic.
#[derive(Debug, Clone, Default)]
pub struct DefinitionDocuments {
    pub universal: RegisterDoc,
    /// Device-model documents keyed by model name.
    pub devices: BTreeMap<String, RegisterDoc>,
    pub equipment: Vec<EquipmentDoc>,
    pub tables: ValueTables,
    pub alarm_codes: Vec<AlarmCode>,
    /// Address of the firmware-version register, for probing.
    pub version_register: Option<u16>,
}

/// A resolved, immutable register catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    registers: Vec<RegisterDefinition>,
    by_id: BTreeMap<String, usize>,
    by_address: BTreeMap<u16, usize>,
    tables: ValueTables,
    alarm_codes: BTreeMap<u16, String>,
    version_register: Option<u16>,
}

impl Catalog {
    /// Registers in resolution order (universal, device, equipment), with
    /// address duplicates already collapsed.
    pub fn registers(&self) -> &[RegisterDefinition] {
        &self.registers
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RegisterDefinition> {
        self.by_id.get(id).map(|i| &self.registers[*i])
    }

    /// Lookup by starting address. Where definitions collided on an address,
    /// the one later in resolution order won.
    pub fn by_address(&self, address: u16) -> Option<&RegisterDefinition> {
        self.by_address.get(&address).map(|i| &self.registers[*i])
    }

    pub fn tables(&self) -> &ValueTables {
        &self.tables
    }

    pub fn alarm_text(&self, code: u16) -> Option<&str> {
        self.alarm_codes.get(&code).map(String::as_str)
    }

    pub fn version_register(&self) -> Option<u16> {
        self.version_register
    }
}

/// Override-merge of two register sets: entries unique to either side are
/// kept, an overlay entry replaces a base entry with the same address in
/// place. Applying the same overlay twice yields the same result as once.
pub fn merge(base: &[RegisterEntry], overlay: &[RegisterEntry]) -> Vec<RegisterEntry> {
    let mut merged = base.to_vec();
    for entry in overlay {
        match merged
            .iter_mut()
            .find(|e| e.starting_address == entry.starting_address)
        {
            Some(slot) => *slot = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

fn parse_access(field: &str) -> Access {
    let field = field.to_lowercase();
    if field.contains("write") || field == "rw" {
        Access::ReadWrite
    } else if field.contains("read") || field == "r" {
        Access::Read
    } else {
        Access::None
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

struct ResolvedEntry {
    entry: RegisterEntry,
    equipment: Option<EquipmentInstance>,
    id_prefix: Option<String>,
}

impl DefinitionDocuments {
    /// Resolve this document set into a catalog for one configuration tuple.
    pub fn resolve(&self, request: &CatalogRequest) -> Result<Catalog, CatalogError> {
        let mut composed: Vec<ResolvedEntry> = Vec::new();

        for entry in &self.universal.registers {
            composed.push(ResolvedEntry {
                entry: entry.clone(),
                equipment: None,
                id_prefix: None,
            });
        }

        let device_registers = self.device_registers(&request.model)?;
        debug!(
            "device model '{}' contributes {} registers",
            request.model,
            device_registers.len()
        );
        for entry in device_registers {
            composed.push(ResolvedEntry {
                entry,
                equipment: None,
                id_prefix: None,
            });
        }

        for doc in &self.equipment {
            let count = request.equipment.get(doc.category);
            if count == 0 {
                continue;
            }
            if count > doc.max_instances {
                return Err(CatalogError::TooManyInstances {
                    category: doc.category,
                    count,
                    max: doc.max_instances,
                });
            }
            for instance in 1..=count {
                let block_start = doc.base_address + u16::from(instance - 1) * doc.stride;
                for template in &doc.registers {
                    composed.push(ResolvedEntry {
                        entry: RegisterEntry {
                            starting_address: block_start + template.address_offset,
                            name: template.name.clone(),
                            data_type: template.data_type,
                            function_codes: template.function_codes,
                            unit_value_table: template.unit_value_table.clone(),
                            user_level: template.user_level.clone(),
                            expert_level: template.expert_level.clone(),
                            min: template.min,
                            max: template.max,
                        },
                        equipment: Some(EquipmentInstance {
                            category: doc.category,
                            instance,
                        }),
                        id_prefix: Some(format!("{}_{}", doc.category.slug(), instance)),
                    });
                }
            }
        }

        // Address deduplication: the definition later in resolution order
        // wins. Earlier duplicates are dropped entirely so every address
        // appears exactly once.
        let mut last_for_address: BTreeMap<u16, usize> = BTreeMap::new();
        for (index, resolved) in composed.iter().enumerate() {
            last_for_address.insert(resolved.entry.starting_address, index);
        }

        let mut registers = Vec::new();
        let mut by_id = BTreeMap::new();
        let mut by_address = BTreeMap::new();
        for (index, resolved) in composed.iter().enumerate() {
            if last_for_address[&resolved.entry.starting_address] != index {
                continue;
            }
            let definition = self.resolve_entry(resolved, request.access_level);
            let mut id = definition.id.clone();
            if by_id.contains_key(&id) {
                id = format!("{}_{}", id, definition.address);
            }
            let slot = registers.len();
            by_id.insert(id.clone(), slot);
            by_address.insert(definition.address, slot);
            registers.push(RegisterDefinition { id, ..definition });
        }

        info!(
            "resolved catalog: {} registers for model '{}', firmware {}, access level {}",
            registers.len(),
            request.model,
            request.firmware_version,
            request.access_level
        );

        Ok(Catalog {
            registers,
            by_id,
            by_address,
            tables: self.tables.clone(),
            alarm_codes: self
                .alarm_codes
                .iter()
                .map(|a| (a.code, a.text.clone()))
                .collect(),
            version_register: self.version_register,
        })
    }

    /// Device registers with base-model inheritance applied.
    fn device_registers(&self, model: &str) -> Result<Vec<RegisterEntry>, CatalogError> {
        let doc = self
            .devices
            .get(model)
            .ok_or_else(|| CatalogError::UnknownModel(model.to_string()))?;

        match &doc.base_model {
            None => Ok(doc.registers.clone()),
            Some(base) => {
                let base_doc =
                    self.devices
                        .get(base)
                        .ok_or_else(|| CatalogError::UnknownBaseModel {
                            model: model.to_string(),
                            base: base.clone(),
                        })?;
                Ok(merge(&base_doc.registers, &doc.registers))
            }
        }
    }

    fn resolve_entry(&self, resolved: &ResolvedEntry, level: AccessLevel) -> RegisterDefinition {
        let entry = &resolved.entry;
        let user = parse_access(&entry.user_level);
        let expert = parse_access(&entry.expert_level);
        let write_level = if user.writable() {
            Some(AccessLevel::User)
        } else if expert.writable() {
            Some(AccessLevel::Expert)
        } else {
            None
        };
        let slug = slugify(&entry.name);
        let id = match &resolved.id_prefix {
            Some(prefix) => format!("{prefix}_{slug}"),
            None => slug,
        };
        RegisterDefinition {
            id,
            name: entry.name.clone(),
            address: entry.starting_address,
            data_type: entry.data_type,
            read: entry.function_codes,
            write_level,
            writable: write_level.is_some_and(|required| level >= required),
            value_spec: ValueSpec::parse(&entry.unit_value_table, &self.tables),
            min: entry.min,
            max: entry.max,
            equipment: resolved.equipment,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    config_path: String,
    #[serde(default)]
    supported_languages: Vec<String>,
    #[serde(default)]
    version_register: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct VersionIndexDoc {
    supported_versions: BTreeMap<String, VersionEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ValueTablesDoc {
    #[serde(default)]
    value_tables: ValueTables,
}

#[derive(Debug, Default, Deserialize)]
struct AlarmCodesDoc {
    #[serde(default)]
    alarm_codes: Vec<AlarmCode>,
}

/// Filesystem loader for the definition document tree.
///
/// Layout, mirroring how KWB ships its ModbusInfo data:
///
/// ```text
/// <root>/version_mapping.json
/// <root>/<config_path>/<language>/universal_registers.json
///                                 value_tables.json
///                                 alarm_codes.json          (optional)
///                                 devices/<model>.json
///                                 equipment/<category>.json
/// ```
#[derive(Debug, Clone)]
pub struct DefinitionSource {
    root: PathBuf,
}

impl DefinitionSource {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load the document set for one firmware version and language.
    ///
    /// An unsupported firmware version fails closed with
    /// [`CatalogError::UnsupportedVersion`]. An unsupported language falls
    /// back to the version's first supported language with a warning.
    pub fn load(&self, version: &str, language: &str) -> Result<DefinitionDocuments, CatalogError> {
        let index: VersionIndexDoc = self.read_doc(&self.root.join("version_mapping.json"))?;
        let entry = index
            .supported_versions
            .get(version)
            .ok_or_else(|| CatalogError::UnsupportedVersion(version.to_string()))?;

        let language = if entry.supported_languages.iter().any(|l| l == language) {
            language
        } else {
            let fallback = entry
                .supported_languages
                .first()
                .map(String::as_str)
                .unwrap_or("en");
            warn!(
                "language '{language}' not available for firmware {version}, using '{fallback}'"
            );
            fallback
        };

        let dir = self.root.join(&entry.config_path).join(language);

        let universal: RegisterDoc = self.read_doc(&dir.join("universal_registers.json"))?;
        let tables: ValueTablesDoc = self.read_doc(&dir.join("value_tables.json"))?;
        let alarm_codes = self.read_optional_doc::<AlarmCodesDoc>(&dir.join("alarm_codes.json"))?;

        let mut devices = BTreeMap::new();
        for (model, file) in MODEL_FILES {
            let path = dir.join("devices").join(file);
            if path.exists() {
                devices.insert(model.to_string(), self.read_doc(&path)?);
            }
        }

        let mut equipment = Vec::new();
        for category in EquipmentCategory::ALL {
            let path = dir
                .join("equipment")
                .join(format!("{}.json", category.slug()));
            if path.exists() {
                equipment.push(self.read_doc::<EquipmentDoc>(&path)?);
            }
        }

        info!(
            "loaded definition documents for firmware {version} ({language}): \
             {} universal registers, {} device models, {} equipment templates, {} value tables",
            universal.registers.len(),
            devices.len(),
            equipment.len(),
            tables.value_tables.0.len(),
        );

        Ok(DefinitionDocuments {
            universal,
            devices,
            equipment,
            tables: tables.value_tables,
            alarm_codes: alarm_codes.unwrap_or_default().alarm_codes,
            version_register: entry.version_register,
        })
    }

    /// Load and resolve in one step.
    pub fn build(&self, request: &CatalogRequest) -> Result<Catalog, CatalogError> {
        self.load(&request.firmware_version, &request.language)?
            .resolve(request)
    }

    fn read_doc<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, CatalogError> {
        let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_optional_doc<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, CatalogError> {
        if !path.exists() {
            return Ok(None);
        }
        self.read_doc(path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(address: u16, name: &str) -> RegisterEntry {
        RegisterEntry {
            starting_address: address,
            name: name.to_string(),
            data_type: DataType::U16,
            function_codes: ReadClass::Either,
            unit_value_table: String::new(),
            user_level: "read".to_string(),
            expert_level: "read_write".to_string(),
            min: None,
            max: None,
        }
    }

    fn scaled_entry(address: u16, name: &str, unit: &str) -> RegisterEntry {
        RegisterEntry {
            unit_value_table: unit.to_string(),
            ..entry(address, name)
        }
    }

    fn documents() -> DefinitionDocuments {
        let mut devices = BTreeMap::new();
        let base: Vec<RegisterEntry> = (0..66)
            .map(|i| scaled_entry(2000 + i * 2, &format!("Combustion value {i}"), "1/10°C"))
            .collect();
        devices.insert(
            "KWB Combifire".to_string(),
            RegisterDoc {
                base_model: None,
                registers: base,
            },
        );
        devices.insert(
            "KWB CF 2".to_string(),
            RegisterDoc {
                base_model: Some("KWB Combifire".to_string()),
                registers: vec![
                    // Overrides an address present in the base with a new scale.
                    scaled_entry(2000, "Combustion value 0", "1/100°C"),
                    // Two registers the base does not have.
                    entry(2200, "Lambda probe state"),
                    entry(2202, "Flue gas fan speed"),
                ],
            },
        );

        DefinitionDocuments {
            universal: RegisterDoc {
                base_model: None,
                registers: vec![entry(8192, "Software version"), entry(8193, "Boiler state")],
            },
            devices,
            equipment: vec![EquipmentDoc {
                category: EquipmentCategory::HeatingCircuit,
                base_address: 4000,
                stride: 40,
                max_instances: 8,
                registers: vec![
                    TemplateEntry {
                        address_offset: 0,
                        name: "Flow temperature".to_string(),
                        data_type: DataType::S16,
                        function_codes: ReadClass::Input,
                        unit_value_table: "1/10°C".to_string(),
                        user_level: "read".to_string(),
                        expert_level: "read".to_string(),
                        min: None,
                        max: None,
                    },
                    TemplateEntry {
                        address_offset: 1,
                        name: "Setpoint".to_string(),
                        data_type: DataType::S16,
                        function_codes: ReadClass::Holding,
                        unit_value_table: "1/10°C".to_string(),
                        user_level: "read_write".to_string(),
                        expert_level: "read_write".to_string(),
                        min: Some(10.0),
                        max: Some(90.0),
                    },
                ],
            }],
            tables: ValueTables::default(),
            alarm_codes: vec![AlarmCode {
                code: 4,
                text: "Low water pressure".to_string(),
            }],
            version_register: Some(8192),
        }
    }

    fn request(model: &str, equipment: EquipmentCounts, level: AccessLevel) -> CatalogRequest {
        CatalogRequest {
            model: model.to_string(),
            firmware_version: "22.7.1".to_string(),
            language: "en".to_string(),
            equipment,
            access_level: level,
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let base = vec![entry(10, "a"), entry(20, "b"), entry(30, "c")];
        let overlay = vec![entry(20, "b override"), entry(40, "d")];

        let once = merge(&base, &overlay);
        let twice = merge(&once, &overlay);
        assert_eq!(once, twice);

        assert_eq!(once.len(), 4);
        assert_eq!(once[1].name, "b override");
        assert_eq!(once[3].name, "d");
    }

    #[test]
    fn base_model_inheritance_yields_expected_counts() {
        let docs = documents();
        let catalog = docs
            .resolve(&request(
                "KWB CF 2",
                EquipmentCounts::default(),
                AccessLevel::User,
            ))
            .unwrap();

        // 2 universal + 66 base + 2 CF-2-only; the CF 2 override replaces a
        // base register in place.
        assert_eq!(catalog.len(), 70);

        let overridden = catalog.by_address(2000).unwrap();
        assert_eq!(
            overridden.value_spec,
            ValueSpec::Scaled {
                divisor: 100,
                unit: "°C".into()
            }
        );

        // Without universal registers the device contribution alone is 68.
        let device_only = docs.device_registers("KWB CF 2").unwrap();
        assert_eq!(device_only.len(), 68);
    }

    #[test]
    fn unknown_model_and_base_fail_closed() {
        let mut docs = documents();
        assert_matches!(
            docs.resolve(&request(
                "KWB Easyfire",
                EquipmentCounts::default(),
                AccessLevel::User
            )),
            Err(CatalogError::UnknownModel(_))
        );

        docs.devices.insert(
            "KWB CF 1".to_string(),
            RegisterDoc {
                base_model: Some("KWB CF 0".to_string()),
                registers: vec![],
            },
        );
        assert_matches!(
            docs.resolve(&request(
                "KWB CF 1",
                EquipmentCounts::default(),
                AccessLevel::User
            )),
            Err(CatalogError::UnknownBaseModel { .. })
        );
    }

    #[test]
    fn equipment_expansion_respects_count_and_stride() {
        let docs = documents();
        let counts = EquipmentCounts {
            heating_circuits: 2,
            ..EquipmentCounts::default()
        };
        let catalog = docs
            .resolve(&request("KWB Combifire", counts, AccessLevel::User))
            .unwrap();

        let first = catalog.get("heating_circuit_1_flow_temperature").unwrap();
        let second = catalog.get("heating_circuit_2_flow_temperature").unwrap();
        assert_eq!(first.address, 4000);
        assert_eq!(second.address, 4040);
        assert_eq!(
            first.equipment,
            Some(EquipmentInstance {
                category: EquipmentCategory::HeatingCircuit,
                instance: 1
            })
        );
        assert_eq!(
            second.equipment,
            Some(EquipmentInstance {
                category: EquipmentCategory::HeatingCircuit,
                instance: 2
            })
        );

        let circuits: Vec<_> = catalog
            .registers()
            .iter()
            .filter(|r| r.equipment.is_some())
            .collect();
        assert_eq!(circuits.len(), 4);
    }

    #[test]
    fn equipment_count_zero_contributes_nothing() {
        let docs = documents();
        let catalog = docs
            .resolve(&request(
                "KWB Combifire",
                EquipmentCounts::default(),
                AccessLevel::User,
            ))
            .unwrap();
        assert!(catalog.registers().iter().all(|r| r.equipment.is_none()));
    }

    #[test]
    fn equipment_count_above_maximum_is_rejected() {
        let docs = documents();
        let counts = EquipmentCounts {
            heating_circuits: 9,
            ..EquipmentCounts::default()
        };
        assert_matches!(
            docs.resolve(&request("KWB Combifire", counts, AccessLevel::User)),
            Err(CatalogError::TooManyInstances {
                category: EquipmentCategory::HeatingCircuit,
                count: 9,
                max: 8,
            })
        );
    }

    #[test]
    fn access_level_degrades_write_exposure() {
        let docs = documents();
        let counts = EquipmentCounts {
            heating_circuits: 1,
            ..EquipmentCounts::default()
        };

        // "Boiler state" is expert-writable in the fixture documents.
        let user_catalog = docs
            .resolve(&request("KWB Combifire", counts, AccessLevel::User))
            .unwrap();
        let boiler_state = user_catalog.get("boiler_state").unwrap();
        assert_eq!(boiler_state.write_level, Some(AccessLevel::Expert));
        assert!(!boiler_state.writable);

        let expert_catalog = docs
            .resolve(&request("KWB Combifire", counts, AccessLevel::Expert))
            .unwrap();
        assert!(expert_catalog.get("boiler_state").unwrap().writable);

        // User-writable setpoint stays writable at user level.
        let setpoint = user_catalog.get("heating_circuit_1_setpoint").unwrap();
        assert_eq!(setpoint.write_level, Some(AccessLevel::User));
        assert!(setpoint.writable);
    }

    #[test]
    fn duplicate_addresses_keep_the_later_definition() {
        let mut docs = documents();
        // A malformed override that collides with a universal register.
        docs.devices
            .get_mut("KWB Combifire")
            .unwrap()
            .registers
            .push(entry(8193, "Boiler state (device override)"));

        let catalog = docs
            .resolve(&request(
                "KWB Combifire",
                EquipmentCounts::default(),
                AccessLevel::User,
            ))
            .unwrap();

        let winner = catalog.by_address(8193).unwrap();
        assert_eq!(winner.name, "Boiler state (device override)");
        assert_eq!(
            catalog
                .registers()
                .iter()
                .filter(|r| r.address == 8193)
                .count(),
            1
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let docs = documents();
        let counts = EquipmentCounts {
            heating_circuits: 3,
            ..EquipmentCounts::default()
        };
        let req = request("KWB CF 2", counts, AccessLevel::Expert);

        let a = docs.resolve(&req).unwrap();
        let b = docs.resolve(&req).unwrap();
        assert_eq!(a.registers(), b.registers());
    }

    #[test]
    fn alarm_codes_are_exposed() {
        let docs = documents();
        let catalog = docs
            .resolve(&request(
                "KWB Combifire",
                EquipmentCounts::default(),
                AccessLevel::User,
            ))
            .unwrap();
        assert_eq!(catalog.alarm_text(4), Some("Low water pressure"));
        assert_eq!(catalog.alarm_text(99), None);
    }

    #[test]
    fn definition_source_loads_shipped_documents() {
        let source =
            DefinitionSource::open(Path::new(env!("CARGO_MANIFEST_DIR")).join("config"));

        assert_matches!(
            source.load("99.0.0", "en"),
            Err(CatalogError::UnsupportedVersion(_))
        );

        let docs = source.load("22.7.1", "en").unwrap();
        assert!(!docs.universal.registers.is_empty());
        assert!(docs.devices.contains_key("KWB Combifire"));
        assert!(docs.devices.contains_key("KWB CF 2"));
        assert_eq!(docs.equipment.len(), 8);
        assert_eq!(docs.version_register, Some(8192));

        let catalog = docs
            .resolve(&CatalogRequest {
                model: "KWB CF 2".to_string(),
                firmware_version: "22.7.1".to_string(),
                language: "en".to_string(),
                equipment: EquipmentCounts {
                    heating_circuits: 2,
                    buffer_storage: 1,
                    ..EquipmentCounts::default()
                },
                access_level: AccessLevel::User,
            })
            .unwrap();
        assert!(!catalog.is_empty());
        assert!(catalog.get("heating_circuit_2_flow_temperature").is_some());
    }
}
