//! Table entry construction from symbolic names.

use super::{DeviceError, Result};
use crate::p4info::DeviceDescription;
use crate::proto::p4::{Action, FieldMatch, TableAction, TableEntry, action, field_match, table_action};
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;

/// Match value of one key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    Exact(Vec<u8>),
    Lpm(Vec<u8>, i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSpec<'a> {
    pub field: &'a str,
    pub kind: MatchKind,
}

impl<'a> MatchSpec<'a> {
    pub fn exact(field: &'a str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            field,
            kind: MatchKind::Exact(value.into()),
        }
    }

    pub fn lpm(field: &'a str, value: impl Into<Vec<u8>>, prefix_len: u8) -> Self {
        Self {
            field,
            kind: MatchKind::Lpm(value.into(), i32::from(prefix_len)),
        }
    }
}

/// A table entry named symbolically.
///
/// An entry without matches sets the table's default (miss) action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySpec<'a> {
    pub table: &'a str,
    pub matches: Vec<MatchSpec<'a>>,
    pub action: &'a str,
    pub params: Vec<(&'a str, Vec<u8>)>,
}

impl<'a> EntrySpec<'a> {
    pub fn new(table: &'a str, action: &'a str) -> Self {
        Self {
            table,
            matches: Vec::new(),
            action,
            params: Vec::new(),
        }
    }

    /// Miss action for `table`.
    pub fn default_action(table: &'a str, action: &'a str) -> Self {
        Self::new(table, action)
    }

    pub fn with_match(mut self, m: MatchSpec<'a>) -> Self {
        self.matches.push(m);
        self
    }

    pub fn with_param(mut self, name: &'a str, value: impl Into<Vec<u8>>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    pub fn is_default(&self) -> bool {
        self.matches.is_empty()
    }
}

pub fn u16_bytes(value: u16) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn ipv4_bytes(addr: Ipv4Addr) -> Vec<u8> {
    addr.octets().to_vec()
}

pub fn mac_bytes(mac: EthernetAddress) -> Vec<u8> {
    mac.as_bytes().to_vec()
}

/// Resolve every name in `spec` against `desc`.
pub fn build_entry(desc: &DeviceDescription, spec: &EntrySpec<'_>) -> Result<TableEntry> {
    let table_id = desc
        .table_id(spec.table)
        .ok_or_else(|| DeviceError::UnknownTable(spec.table.to_string()))?;
    let action_id = desc
        .action_id(table_id, spec.action)
        .ok_or_else(|| DeviceError::UnknownAction {
            table: spec.table.to_string(),
            action: spec.action.to_string(),
        })?;

    let matches = spec
        .matches
        .iter()
        .map(|m| {
            let field_id = desc
                .field_id(m.field)
                .ok_or_else(|| DeviceError::UnknownField(m.field.to_string()))?;
            let field_match_type = match &m.kind {
                MatchKind::Exact(value) => {
                    field_match::FieldMatchType::Exact(field_match::Exact {
                        value: value.clone(),
                    })
                }
                MatchKind::Lpm(value, prefix_len) => {
                    field_match::FieldMatchType::Lpm(field_match::Lpm {
                        value: value.clone(),
                        prefix_len: *prefix_len,
                    })
                }
            };
            Ok(FieldMatch {
                field_id,
                field_match_type: Some(field_match_type),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let params = spec
        .params
        .iter()
        .map(|(name, value)| {
            let param_id = desc.action_param_id(action_id, name).ok_or_else(|| {
                DeviceError::UnknownParam {
                    action: spec.action.to_string(),
                    param: name.to_string(),
                }
            })?;
            Ok(action::Param {
                param_id,
                value: value.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TableEntry {
        table_id,
        r#match: matches,
        action: Some(TableAction {
            r#type: Some(table_action::Type::Action(Action { action_id, params })),
        }),
        priority: 0,
    })
}
