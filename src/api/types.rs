//! REST API v1 request/response bodies

use serde::{Deserialize, Serialize};

use crate::id::Id;
use crate::models::{GroupModel, Rule, RuleKind};

#[derive(Debug, Serialize)]
pub struct ErrorRes {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupsRes {
    pub groups: Vec<GroupRes>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupRes {
    pub id: Id,
    pub name: String,
    pub color: String,
    pub interface: String,
    pub enable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleRes>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleRes {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub rule: String,
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
pub struct GroupsReq {
    pub groups: Option<Vec<GroupReq>>,
}

#[derive(Debug, Deserialize)]
pub struct GroupReq {
    pub id: Option<Id>,
    pub name: String,
    pub color: Option<String>,
    pub interface: String,
    pub enable: Option<bool>,
    pub rules: Option<Vec<RuleReq>>,
}

#[derive(Debug, Deserialize)]
pub struct RulesReq {
    pub rules: Option<Vec<RuleReq>>,
}

#[derive(Debug, Deserialize)]
pub struct RuleReq {
    pub id: Option<Id>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub rule: String,
    pub enable: bool,
}

#[derive(Debug, Serialize)]
pub struct InterfacesRes {
    pub interfaces: Vec<InterfaceRes>,
}

#[derive(Debug, Serialize)]
pub struct InterfaceRes {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct NetfilterDHookReq {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub table: String,
}

/// Render a group, optionally with its rule list
#[must_use]
pub fn group_res(model: &GroupModel, with_rules: bool) -> GroupRes {
    GroupRes {
        id: model.id,
        name: model.name.clone(),
        color: model.color.clone(),
        interface: model.interface.clone(),
        enable: model.enable,
        rules: with_rules.then(|| model.rules.iter().map(rule_res).collect()),
    }
}

#[must_use]
pub fn rule_res(rule: &Rule) -> RuleRes {
    RuleRes {
        id: rule.id,
        name: rule.name.clone(),
        kind: rule.kind,
        rule: rule.rule.clone(),
        enable: rule.enable,
    }
}

/// Build a rule model, minting an ID when the request carries none
#[must_use]
pub fn rule_from_req(req: &RuleReq) -> Rule {
    Rule {
        id: req.id.unwrap_or_else(Id::random),
        name: req.name.clone(),
        kind: req.kind,
        rule: req.rule.clone(),
        enable: req.enable,
    }
}

/// Build a group model, minting IDs where the request carries none
#[must_use]
pub fn group_from_req(req: &GroupReq) -> GroupModel {
    let mut model = GroupModel {
        id: req.id.unwrap_or_else(Id::random),
        name: req.name.clone(),
        color: req.color.clone().unwrap_or_default(),
        interface: req.interface.clone(),
        enable: req.enable.unwrap_or(true),
        rules: req
            .rules
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(rule_from_req)
            .collect(),
    };
    model.normalize_color();
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_res_json_shape() {
        let model = GroupModel {
            id: Id::from([0xaa, 0xbb, 0xcc, 0xdd]),
            name: "vpn".into(),
            color: "#ffffff".into(),
            interface: "nwg0".into(),
            enable: true,
            rules: vec![Rule {
                id: Id::from([1, 2, 3, 4]),
                name: "r".into(),
                kind: RuleKind::Wildcard,
                rule: "*.example.com".into(),
                enable: true,
            }],
        };

        let json = serde_json::to_value(group_res(&model, true)).unwrap();
        assert_eq!(json["id"], "aabbccdd");
        assert_eq!(json["rules"][0]["type"], "wildcard");

        let json = serde_json::to_value(group_res(&model, false)).unwrap();
        assert!(json.get("rules").is_none());
    }

    #[test]
    fn test_group_from_req_mints_ids_and_coerces_color() {
        let req = GroupReq {
            id: None,
            name: "vpn".into(),
            color: Some("nope".into()),
            interface: "nwg0".into(),
            enable: None,
            rules: Some(vec![RuleReq {
                id: None,
                name: "r".into(),
                kind: RuleKind::Domain,
                rule: "example.com".into(),
                enable: true,
            }]),
        };
        let model = group_from_req(&req);
        assert_eq!(model.color, "#ffffff");
        assert!(model.enable);
        assert_eq!(model.rules.len(), 1);
    }

    #[test]
    fn test_hook_req_defaults() {
        let req: NetfilterDHookReq = serde_json::from_str("{}").unwrap();
        assert_eq!(req.kind, "");
        assert_eq!(req.table, "");

        let req: NetfilterDHookReq =
            serde_json::from_str(r#"{"type":"ip6tables","table":"mangle"}"#).unwrap();
        assert_eq!(req.kind, "ip6tables");
        assert_eq!(req.table, "mangle");
    }
}
