//! Config import/export
//!
//! Importing merges the file's optional fields over the current settings,
//! rebuilds the netfilter factory (prefixes may have changed) and replaces
//! the group list. Exporting renders the full current state, so a saved
//! file always round-trips.

use tracing::error;

use crate::app::App;
use crate::config::{self, AppSettings, ConfigFile, CONFIG_VERSION};
use crate::error::AppError;
use crate::paths;

impl App {
    /// Load and import the config file from its fixed location
    ///
    /// A missing file is fine: defaults stay in effect.
    pub async fn load_config(&self) -> Result<(), AppError> {
        let Some(file) = config::load_file(paths::CONFIG_FILE)? else {
            return Ok(());
        };
        self.import_config(file).await
    }

    /// Import a parsed config file
    ///
    /// Rejected wholesale when the version prefix is unsupported; the
    /// current settings then stay untouched.
    pub async fn import_config(&self, file: ConfigFile) -> Result<(), AppError> {
        file.check_version().map_err(AppError::Config)?;

        if let Some(app_section) = &file.app {
            let rebuilt = {
                let mut settings = self.settings.write();
                settings.apply(app_section);
                App::netfilter_for(&settings)
            };
            *self.nf.write() = std::sync::Arc::new(rebuilt);
            self.apply_log_level();
        }

        if let Some(groups) = file.groups {
            self.clear_groups().await;
            for group in groups {
                self.add_group(group).await?;
            }
        }

        Ok(())
    }

    /// Render the full current state as a config file
    #[must_use]
    pub fn export_config(&self) -> ConfigFile {
        let settings: AppSettings = self.settings();
        let groups = self.groups().iter().map(|g| g.model()).collect();
        ConfigFile {
            config_version: CONFIG_VERSION.to_string(),
            app: Some(settings.to_section()),
            groups: Some(groups),
        }
    }

    /// Persist the current state to the fixed config location
    pub fn save_config(&self) -> Result<(), AppError> {
        config::save_file(paths::CONFIG_FILE, &self.export_config()).map_err(AppError::Config)
    }

    /// Reload the config file, logging instead of failing
    ///
    /// Used by the SIGHUP handler: a broken file on disk must not take the
    /// running daemon down.
    pub async fn reload_config(&self) {
        if let Err(e) = self.load_config().await {
            error!(error = %e, "failed to reload config file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::id::Id;
    use crate::models::{GroupModel, Rule, RuleKind};

    fn group_model(id: u8) -> GroupModel {
        GroupModel {
            id: Id::from([0, 0, 0, id]),
            name: format!("group-{id}"),
            color: "#112233".into(),
            interface: "nwg0".into(),
            enable: true,
            rules: vec![Rule {
                id: Id::from([1, 0, 0, id]),
                name: "r".into(),
                kind: RuleKind::Namespace,
                rule: "example.com".into(),
                enable: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_import_rejects_unsupported_version() {
        let app = App::new();
        let file = ConfigFile {
            config_version: "1.0.0".into(),
            app: None,
            groups: None,
        };
        assert!(matches!(
            app.import_config(file).await.unwrap_err(),
            AppError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_import_replaces_groups() {
        let app = App::new();
        app.add_group(group_model(1)).await.unwrap();

        let file = ConfigFile {
            config_version: "0.1.0".into(),
            app: None,
            groups: Some(vec![group_model(2), group_model(3)]),
        };
        app.import_config(file).await.unwrap();

        let groups = app.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id(), Id::from([0, 0, 0, 2]));
    }

    #[tokio::test]
    async fn test_import_duplicate_group_id_rejected() {
        let app = App::new();
        let file = ConfigFile {
            config_version: "0.1.0".into(),
            app: None,
            groups: Some(vec![group_model(1), group_model(1)]),
        };
        assert!(matches!(
            app.import_config(file).await.unwrap_err(),
            AppError::GroupIdConflict
        ));
    }

    #[tokio::test]
    async fn test_duplicate_rule_id_rejected() {
        let app = App::new();
        let mut model = group_model(1);
        let dup = model.rules[0].clone();
        model.rules.push(dup);
        assert!(matches!(
            app.add_group(model).await.unwrap_err(),
            AppError::RuleIdConflict
        ));
    }

    #[tokio::test]
    async fn test_export_round_trips_groups() {
        let app = App::new();
        app.add_group(group_model(1)).await.unwrap();

        let exported = app.export_config();
        assert_eq!(exported.config_version, CONFIG_VERSION);
        let groups = exported.groups.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].rules.len(), 1);
    }

    #[tokio::test]
    async fn test_import_coerces_bad_color() {
        let app = App::new();
        let mut model = group_model(1);
        model.color = "chartreuse".into();
        let file = ConfigFile {
            config_version: "0.1.0".into(),
            app: None,
            groups: Some(vec![model]),
        };
        app.import_config(file).await.unwrap();
        assert_eq!(app.groups()[0].model().color, "#ffffff");
    }
}
