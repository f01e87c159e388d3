//! The structured result of one vacuum run.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindReport {
    /// Live resources enumerated.
    pub listed: usize,
    /// Events handed to the sink.
    pub submitted: usize,
    /// Resources excluded by retention clauses.
    pub kept_back: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct NamespaceReport {
    #[serde(flatten)]
    pub kinds: BTreeMap<String, KindReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct VacuumReport {
    #[serde(flatten)]
    pub namespaces: BTreeMap<String, NamespaceReport>,
}

impl VacuumReport {
    pub fn kind_report(&mut self, namespace: &str, kind: &str) -> &mut KindReport {
        self.namespaces
            .entry(namespace.to_owned())
            .or_default()
            .kinds
            .entry(kind.to_owned())
            .or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.namespaces
            .values()
            .flat_map(|namespace| namespace.kinds.values())
            .any(|kind| !kind.errors.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_per_namespace_and_kind() {
        let mut report = VacuumReport::default();
        report.kind_report("a", "Pod").listed = 3;
        report.kind_report("a", "Pod").submitted = 2;
        report.kind_report("a", "Job").kept_back = 1;
        report.kind_report("b", "Pod").errors.push("boom".into());

        assert!(report.has_errors());
        assert_eq!(report.namespaces["a"].kinds["Pod"].listed, 3);

        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("keptBack"));
        assert!(yaml.contains("boom"));
    }

    #[test]
    fn clean_runs_have_no_errors() {
        let mut report = VacuumReport::default();
        report.kind_report("a", "Pod").listed = 1;
        assert!(!report.has_errors());
    }
}
