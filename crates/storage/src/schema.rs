//! Schema-version-suffixed table names (spec.md §6: `kyomei_sync_vN`,
//! `kyomei_app_vN`, `kyomei_crons_vN`). The suffix lets multiple spec
//! versions of the same database coexist during a migration.

#[derive(Debug, Clone, Copy)]
pub struct Schema {
    version: u32,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self { version }
    }

    pub fn sync(&self) -> String {
        format!("kyomei_sync_v{}", self.version)
    }

    pub fn app(&self) -> String {
        format!("kyomei_app_v{}", self.version)
    }

    pub fn raw_events(&self) -> String {
        format!("{}.raw_events", self.sync())
    }

    pub fn sync_workers(&self) -> String {
        format!("{}.sync_workers", self.sync())
    }

    pub fn factory_children(&self) -> String {
        format!("{}.factory_children", self.sync())
    }

    pub fn rpc_cache(&self) -> String {
        format!("{}.rpc_cache", self.sync())
    }

    pub fn process_workers(&self) -> String {
        format!("{}.process_workers", self.app())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_tables_with_version_suffix() {
        let schema = Schema::new(1);
        assert_eq!(schema.raw_events(), "kyomei_sync_v1.raw_events");
        assert_eq!(schema.process_workers(), "kyomei_app_v1.process_workers");
    }
}
