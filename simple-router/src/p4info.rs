//! Device description: the table/action/field/counter namespace of the
//! program loaded on the switch.
//!
//! The description is parsed from the bmv2 JSON that is also pushed to the
//! device. Identifiers are assigned from declaration order and tagged with a
//! resource type in the top byte, so ids of different kinds never collide and
//! `0` is never a valid id.

use crate::proto::p4::config as pb;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Resource type tags (top 8 bits of an id)
const ACTION_TYPE: u32 = 0x01;
const TABLE_TYPE: u32 = 0x02;
const FIELD_TYPE: u32 = 0x04;
const COUNTER_TYPE: u32 = 0x12;

fn make_id(kind: u32, index: usize) -> u32 {
    (kind << 24) | (index as u32 + 1)
}

fn index_of(id: u32, kind: u32) -> Option<usize> {
    if id >> 24 != kind || id & 0x00ff_ffff == 0 {
        return None;
    }
    Some((id & 0x00ff_ffff) as usize - 1)
}

/// Description errors.
#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("Header {header} uses undeclared header type {header_type}")]
    UnknownHeaderType { header: String, header_type: String },

    #[error("Malformed field list in header type {0}")]
    InvalidField(String),

    #[error("Table {table} matches on undeclared field {field}")]
    UnknownKeyField { table: String, field: String },

    #[error("Table {table} references undeclared action {action}")]
    UnknownTableAction { table: String, action: String },

    #[error("Table {table} uses unsupported match type {match_type}")]
    UnsupportedMatchType { table: String, match_type: String },
}

pub type Result<T> = std::result::Result<T, DescriptionError>;

// bmv2 JSON subset. Unknown keys are ignored.

#[derive(Deserialize)]
struct Bmv2Json {
    #[serde(default)]
    header_types: Vec<HeaderTypeJson>,
    #[serde(default)]
    headers: Vec<HeaderJson>,
    #[serde(default)]
    actions: Vec<ActionJson>,
    #[serde(default)]
    pipelines: Vec<PipelineJson>,
    #[serde(default)]
    counter_arrays: Vec<CounterJson>,
}

#[derive(Deserialize)]
struct HeaderTypeJson {
    name: String,
    /// `[name, bitwidth, ...]` tuples
    fields: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct HeaderJson {
    name: String,
    header_type: String,
}

#[derive(Deserialize)]
struct ActionJson {
    name: String,
    #[serde(default)]
    runtime_data: Vec<ParamJson>,
}

#[derive(Deserialize)]
struct ParamJson {
    name: String,
    bitwidth: i32,
}

#[derive(Deserialize)]
struct PipelineJson {
    #[serde(default)]
    tables: Vec<TableJson>,
}

#[derive(Deserialize)]
struct TableJson {
    name: String,
    #[serde(default)]
    max_size: i64,
    #[serde(default)]
    key: Vec<KeyJson>,
    #[serde(default)]
    actions: Vec<String>,
}

#[derive(Deserialize)]
struct KeyJson {
    match_type: String,
    target: Vec<String>,
}

#[derive(Deserialize)]
struct CounterJson {
    name: String,
    #[serde(default)]
    size: i64,
}

/// How a table key field is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Valid,
    Exact,
    Lpm,
    Ternary,
    Range,
}

impl MatchType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(MatchType::Valid),
            "exact" => Some(MatchType::Exact),
            "lpm" => Some(MatchType::Lpm),
            "ternary" => Some(MatchType::Ternary),
            "range" => Some(MatchType::Range),
            _ => None,
        }
    }

    fn to_proto(self) -> pb::match_field::MatchType {
        match self {
            MatchType::Valid => pb::match_field::MatchType::Valid,
            MatchType::Exact => pb::match_field::MatchType::Exact,
            MatchType::Lpm => pb::match_field::MatchType::Lpm,
            MatchType::Ternary => pb::match_field::MatchType::Ternary,
            MatchType::Range => pb::match_field::MatchType::Range,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchFieldInfo {
    pub field_id: u32,
    pub match_type: MatchType,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u32,
    pub name: String,
    pub match_fields: Vec<MatchFieldInfo>,
    pub action_ids: Vec<u32>,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub id: u32,
    pub name: String,
    pub bitwidth: i32,
}

#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub id: u32,
    pub name: String,
    pub params: Vec<ParamInfo>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub id: u32,
    pub name: String,
    pub bitwidth: i32,
}

#[derive(Debug, Clone)]
pub struct CounterInfo {
    pub id: u32,
    pub name: String,
    pub size: i64,
}

/// Parsed device description.
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    tables: Vec<TableInfo>,
    actions: Vec<ActionInfo>,
    fields: Vec<FieldInfo>,
    counters: Vec<CounterInfo>,
    table_names: HashMap<String, u32>,
    action_names: HashMap<String, u32>,
    field_names: HashMap<String, u32>,
    counter_names: HashMap<String, u32>,
}

fn insert_unique(
    map: &mut HashMap<String, u32>,
    kind: &'static str,
    name: &str,
    id: u32,
) -> Result<()> {
    if map.insert(name.to_string(), id).is_some() {
        return Err(DescriptionError::Duplicate {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

impl DeviceDescription {
    /// Parse a bmv2 JSON configuration.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let json: Bmv2Json = serde_json::from_slice(raw)?;

        let mut field_names = HashMap::new();
        let mut fields = Vec::new();
        let header_types: HashMap<&str, &HeaderTypeJson> = json
            .header_types
            .iter()
            .map(|ht| (ht.name.as_str(), ht))
            .collect();
        for header in &json.headers {
            let ht = header_types
                .get(header.header_type.as_str())
                .ok_or_else(|| DescriptionError::UnknownHeaderType {
                    header: header.name.clone(),
                    header_type: header.header_type.clone(),
                })?;
            for field in &ht.fields {
                let (Some(name), Some(bitwidth)) = (
                    field.first().and_then(|v| v.as_str()),
                    field.get(1).and_then(|v| v.as_i64()),
                ) else {
                    return Err(DescriptionError::InvalidField(ht.name.clone()));
                };
                let id = make_id(FIELD_TYPE, fields.len());
                let full_name = format!("{}.{}", header.name, name);
                insert_unique(&mut field_names, "field", &full_name, id)?;
                fields.push(FieldInfo {
                    id,
                    name: full_name,
                    bitwidth: bitwidth as i32,
                });
            }
        }

        let mut action_names = HashMap::new();
        let mut actions = Vec::with_capacity(json.actions.len());
        for (i, action) in json.actions.iter().enumerate() {
            let id = make_id(ACTION_TYPE, i);
            insert_unique(&mut action_names, "action", &action.name, id)?;
            let params = action
                .runtime_data
                .iter()
                .enumerate()
                .map(|(j, p)| ParamInfo {
                    id: j as u32 + 1,
                    name: p.name.clone(),
                    bitwidth: p.bitwidth,
                })
                .collect();
            actions.push(ActionInfo {
                id,
                name: action.name.clone(),
                params,
            });
        }

        let mut table_names = HashMap::new();
        let mut tables = Vec::new();
        for table in json.pipelines.iter().flat_map(|p| &p.tables) {
            let id = make_id(TABLE_TYPE, tables.len());
            insert_unique(&mut table_names, "table", &table.name, id)?;

            let mut match_fields = Vec::with_capacity(table.key.len());
            for key in &table.key {
                let field = key.target.join(".");
                let field_id = *field_names.get(&field).ok_or_else(|| {
                    DescriptionError::UnknownKeyField {
                        table: table.name.clone(),
                        field: field.clone(),
                    }
                })?;
                let match_type = MatchType::parse(&key.match_type).ok_or_else(|| {
                    DescriptionError::UnsupportedMatchType {
                        table: table.name.clone(),
                        match_type: key.match_type.clone(),
                    }
                })?;
                match_fields.push(MatchFieldInfo {
                    field_id,
                    match_type,
                });
            }

            let action_ids = table
                .actions
                .iter()
                .map(|a| {
                    action_names
                        .get(a)
                        .copied()
                        .ok_or_else(|| DescriptionError::UnknownTableAction {
                            table: table.name.clone(),
                            action: a.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            tables.push(TableInfo {
                id,
                name: table.name.clone(),
                match_fields,
                action_ids,
                size: table.max_size,
            });
        }

        let mut counter_names = HashMap::new();
        let mut counters = Vec::with_capacity(json.counter_arrays.len());
        for (i, counter) in json.counter_arrays.iter().enumerate() {
            let id = make_id(COUNTER_TYPE, i);
            insert_unique(&mut counter_names, "counter", &counter.name, id)?;
            counters.push(CounterInfo {
                id,
                name: counter.name.clone(),
                size: counter.size,
            });
        }

        Ok(Self {
            tables,
            actions,
            fields,
            counters,
            table_names,
            action_names,
            field_names,
            counter_names,
        })
    }

    /// Read and parse a bmv2 JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Self::parse(&raw)
    }

    pub fn table_id(&self, name: &str) -> Option<u32> {
        self.table_names.get(name).copied()
    }

    pub fn table(&self, id: u32) -> Option<&TableInfo> {
        self.tables.get(index_of(id, TABLE_TYPE)?)
    }

    /// Id of `name`, provided the table lists it among its actions.
    pub fn action_id(&self, table_id: u32, name: &str) -> Option<u32> {
        let id = *self.action_names.get(name)?;
        self.table(table_id)?
            .action_ids
            .contains(&id)
            .then_some(id)
    }

    pub fn action(&self, id: u32) -> Option<&ActionInfo> {
        self.actions.get(index_of(id, ACTION_TYPE)?)
    }

    pub fn field_id(&self, name: &str) -> Option<u32> {
        self.field_names.get(name).copied()
    }

    pub fn action_param_id(&self, action_id: u32, name: &str) -> Option<u32> {
        self.action(action_id)?
            .params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
    }

    pub fn counter_id(&self, name: &str) -> Option<u32> {
        self.counter_names.get(name).copied()
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn counters(&self) -> &[CounterInfo] {
        &self.counters
    }

    /// Serialize into the wire representation sent with assign/update.
    pub fn to_proto(&self) -> pb::P4Info {
        pb::P4Info {
            tables: self
                .tables
                .iter()
                .map(|t| pb::Table {
                    preamble: Some(pb::Preamble {
                        id: t.id,
                        name: t.name.clone(),
                    }),
                    match_fields: t
                        .match_fields
                        .iter()
                        .map(|m| pb::MatchField {
                            header_field_id: m.field_id,
                            match_type: m.match_type.to_proto() as i32,
                        })
                        .collect(),
                    action_ids: t.action_ids.clone(),
                    size: t.size,
                })
                .collect(),
            actions: self
                .actions
                .iter()
                .map(|a| pb::Action {
                    preamble: Some(pb::Preamble {
                        id: a.id,
                        name: a.name.clone(),
                    }),
                    params: a
                        .params
                        .iter()
                        .map(|p| pb::action::Param {
                            id: p.id,
                            name: p.name.clone(),
                            bitwidth: p.bitwidth,
                        })
                        .collect(),
                })
                .collect(),
            header_fields: self
                .fields
                .iter()
                .map(|f| pb::HeaderField {
                    preamble: Some(pb::Preamble {
                        id: f.id,
                        name: f.name.clone(),
                    }),
                    bitwidth: f.bitwidth,
                })
                .collect(),
            counters: self
                .counters
                .iter()
                .map(|c| pb::Counter {
                    preamble: Some(pb::Preamble {
                        id: c.id,
                        name: c.name.clone(),
                    }),
                    size: c.size,
                })
                .collect(),
        }
    }
}
