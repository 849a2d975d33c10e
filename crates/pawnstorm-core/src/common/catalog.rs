//! Records exchanged with the catalog naming service.
//!
//! Workers announce themselves with a [`Heartbeat`] datagram; the catalog
//! stamps it with the sender's address and a `lastheardfrom` time, and serves
//! the collected [`CatalogRecord`]s as a JSON array.

use serde::{Deserialize, Serialize};

/// Registration datagram a worker sends to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Role tag shared by every worker.
    #[serde(rename = "type")]
    pub role: String,
    pub owner: String,
    /// The worker's TCP listening port.
    pub port: u16,
    /// Logical worker name, e.g. `alpha-03`.
    pub project: String,
}

/// One entry of the catalog's record dump.
///
/// The catalog holds records from unrelated services too, so every field is
/// optional and only complete records are ever selected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "type", default)]
    pub role: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub lastheardfrom: Option<f64>,
}

impl CatalogRecord {
    /// `host:port` if both halves are present.
    pub fn endpoint(&self) -> Option<String> {
        Some(format!("{}:{}", self.address.as_deref()?, self.port?))
    }

    fn matches(&self, role: &str, name: &str) -> bool {
        self.role.as_deref() == Some(role) && self.project.as_deref() == Some(name)
    }
}

/// Picks the most recently heard-from record for `name` under `role`.
///
/// Ties go to the later record. Records without an endpoint are ignored.
pub fn select_freshest<'a>(
    records: &'a [CatalogRecord],
    role: &str,
    name: &str,
) -> Option<&'a CatalogRecord> {
    records
        .iter()
        .filter(|r| r.matches(role, name) && r.endpoint().is_some())
        .fold(None, |best: Option<&CatalogRecord>, r| match best {
            Some(b) if b.lastheardfrom.unwrap_or(0.0) > r.lastheardfrom.unwrap_or(0.0) => {
                Some(b)
            }
            _ => Some(r),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(project: &str, address: &str, seen: f64) -> CatalogRecord {
        CatalogRecord {
            role: Some("chess-worker".into()),
            project: Some(project.into()),
            owner: None,
            address: Some(address.into()),
            port: Some(9000),
            lastheardfrom: Some(seen),
        }
    }

    #[test]
    fn freshest_matching_record_wins() {
        let records = vec![
            record("alpha-00", "10.0.0.1", 100.0),
            record("alpha-00", "10.0.0.2", 300.0),
            record("alpha-01", "10.0.0.3", 900.0),
            record("alpha-00", "10.0.0.4", 200.0),
        ];
        let best = select_freshest(&records, "chess-worker", "alpha-00").unwrap();
        assert_eq!(best.endpoint().unwrap(), "10.0.0.2:9000");
    }

    #[test]
    fn ties_go_to_the_last_record_scanned() {
        let records = vec![
            record("alpha-00", "10.0.0.1", 5.0),
            record("alpha-00", "10.0.0.2", 5.0),
        ];
        let best = select_freshest(&records, "chess-worker", "alpha-00").unwrap();
        assert_eq!(best.address.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn role_and_completeness_are_required() {
        let mut wrong_role = record("alpha-00", "10.0.0.1", 50.0);
        wrong_role.role = Some("alpha-00".into());
        let mut no_port = record("alpha-00", "10.0.0.2", 60.0);
        no_port.port = None;
        let records = vec![wrong_role, no_port];
        assert!(select_freshest(&records, "chess-worker", "alpha-00").is_none());
    }

    #[test]
    fn heartbeat_uses_catalog_field_names() {
        let hb = Heartbeat {
            role: "chess-worker".into(),
            owner: "nobody".into(),
            port: 4242,
            project: "alpha-00".into(),
        };
        assert_eq!(
            serde_json::to_string(&hb).unwrap(),
            r#"{"type":"chess-worker","owner":"nobody","port":4242,"project":"alpha-00"}"#
        );
    }

    #[test]
    fn partial_records_decode() {
        let json = r#"{"type":"wq","address":"1.2.3.4","lastheardfrom":1700000000.5,"extra":1}"#;
        let rec: CatalogRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.role.as_deref(), Some("wq"));
        assert_eq!(rec.port, None);
        assert_eq!(rec.endpoint(), None);
    }
}
