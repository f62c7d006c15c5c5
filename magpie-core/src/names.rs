//! Resource-name grammar for records and projects.
//!
//! Accepted shapes:
//! - record: `warehouses/<id>/projects/<id>/records/<id>` or
//!   `projects/<id>/records/<id>`
//! - project: `warehouses/<id>/projects/<id>` or `projects/<id>`
//!
//! Anything else is rejected.

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordName {
    pub name: String,
    pub warehouse_id: Option<String>,
    pub project_id: String,
    pub record_id: String,
}

impl RecordName {
    pub fn parse(record_name: &str) -> Result<Self> {
        let parts: Vec<&str> = record_name.split('/').collect();
        match parts.as_slice() {
            ["projects", project_id, "records", record_id] => Ok(Self {
                name: record_name.to_string(),
                warehouse_id: None,
                project_id: (*project_id).to_string(),
                record_id: (*record_id).to_string(),
            }),
            ["warehouses", warehouse_id, "projects", project_id, "records", record_id] => {
                Ok(Self {
                    name: record_name.to_string(),
                    warehouse_id: Some((*warehouse_id).to_string()),
                    project_id: (*project_id).to_string(),
                    record_id: (*record_id).to_string(),
                })
            }
            _ => Err(AgentError::InvalidName(record_name.to_string())),
        }
    }

    /// Warehouse-less form used as the object-store key prefix.
    pub fn simple_record_name(&self) -> String {
        format!("projects/{}/records/{}", self.project_id, self.record_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectName {
    pub name: String,
    pub warehouse_id: Option<String>,
    pub project_id: String,
}

impl ProjectName {
    pub fn parse(project_name: &str) -> Result<Self> {
        let parts: Vec<&str> = project_name.split('/').collect();
        match parts.as_slice() {
            ["projects", project_id] => Ok(Self {
                name: project_name.to_string(),
                warehouse_id: None,
                project_id: (*project_id).to_string(),
            }),
            ["warehouses", warehouse_id, "projects", project_id] => Ok(Self {
                name: project_name.to_string(),
                warehouse_id: Some((*warehouse_id).to_string()),
                project_id: (*project_id).to_string(),
            }),
            _ => Err(AgentError::InvalidName(project_name.to_string())),
        }
    }

    pub fn with_warehouse_and_project_id(warehouse_id: Option<&str>, project_id: &str) -> Self {
        match warehouse_id {
            Some(wh) => Self {
                name: format!("warehouses/{wh}/projects/{project_id}"),
                warehouse_id: Some(wh.to_string()),
                project_id: project_id.to_string(),
            },
            None => Self {
                name: format!("projects/{project_id}"),
                warehouse_id: None,
                project_id: project_id.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_record_shapes() {
        let rn = RecordName::parse("warehouses/wh1/projects/p1/records/r1").unwrap();
        assert_eq!(rn.warehouse_id.as_deref(), Some("wh1"));
        assert_eq!(rn.project_id, "p1");
        assert_eq!(rn.record_id, "r1");
        assert_eq!(rn.simple_record_name(), "projects/p1/records/r1");

        let rn = RecordName::parse("projects/p2/records/r2").unwrap();
        assert_eq!(rn.warehouse_id, None);
        assert_eq!(rn.simple_record_name(), "projects/p2/records/r2");
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "",
            "records/r1",
            "projects/p1/record/r1",
            "warehouses/w/projects/p/records",
            "warehouses/w/projects/p/records/r/extra",
        ] {
            assert!(RecordName::parse(bad).is_err(), "accepted {bad:?}");
        }
        assert!(ProjectName::parse("warehouses/w").is_err());
        assert!(ProjectName::parse("projects/p/records/r").is_err());
    }

    #[test]
    fn project_name_round_trip() {
        let pn = ProjectName::with_warehouse_and_project_id(Some("w"), "p");
        assert_eq!(pn.name, "warehouses/w/projects/p");
        assert_eq!(ProjectName::parse(&pn.name).unwrap(), pn);

        let pn = ProjectName::with_warehouse_and_project_id(None, "p");
        assert_eq!(pn.name, "projects/p");
    }
}
