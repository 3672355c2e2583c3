//! Template store: built-in presets seeded in memory plus user
//! templates persisted one JSON file per template.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use cf_domain::template::{preset_templates, EditTemplate};
use cf_domain::{unix_now, Error, Result};

pub struct TemplateStore {
    dir: PathBuf,
    cache: RwLock<Cache>,
}

#[derive(Default)]
struct Cache {
    templates: HashMap<String, EditTemplate>,
    loaded: bool,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache: RwLock::new(Cache::default()),
        })
    }

    /// All templates, presets first, then user templates by creation
    /// time.
    pub fn list_all(&self) -> Vec<EditTemplate> {
        self.ensure_loaded();
        let cache = self.cache.read();
        let mut templates: Vec<EditTemplate> = cache.templates.values().cloned().collect();
        templates.sort_by(|a, b| {
            (!a.is_preset, a.created_at)
                .partial_cmp(&(!b.is_preset, b.created_at))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        templates
    }

    pub fn get(&self, template_id: &str) -> Option<EditTemplate> {
        self.ensure_loaded();
        self.cache.read().templates.get(template_id).cloned()
    }

    /// Create or update a user template and persist it to disk.
    pub fn save(&self, mut template: EditTemplate) -> Result<EditTemplate> {
        self.ensure_loaded();
        template.validate()?;

        template.updated_at = unix_now();
        {
            let mut cache = self.cache.write();
            if !cache.templates.contains_key(&template.template_id) {
                template.created_at = unix_now();
            }
            cache
                .templates
                .insert(template.template_id.clone(), template.clone());
        }

        let path = self.dir.join(format!("{}.json", template.template_id));
        std::fs::write(&path, serde_json::to_vec_pretty(&template)?)?;
        tracing::info!(template_id = %template.template_id, path = %path.display(), "template saved");
        Ok(template)
    }

    /// Delete a user template. Presets are immutable; deleting one is
    /// `Forbidden`. Returns `false` for unknown ids.
    pub fn delete(&self, template_id: &str) -> Result<bool> {
        self.ensure_loaded();
        {
            let mut cache = self.cache.write();
            let Some(template) = cache.templates.get(template_id) else {
                return Ok(false);
            };
            if template.is_preset {
                return Err(Error::Forbidden(format!(
                    "cannot delete preset template: {template_id}"
                )));
            }
            cache.templates.remove(template_id);
        }

        let path = self.dir.join(format!("{template_id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(true)
    }

    // ── Private ──────────────────────────────────────────────────────

    /// Presets first, then user files; a user template may shadow a
    /// preset id (a user-edited fork of a preset).
    fn ensure_loaded(&self) {
        if self.cache.read().loaded {
            return;
        }
        let mut cache = self.cache.write();
        if cache.loaded {
            return;
        }
        for preset in preset_templates() {
            cache.templates.insert(preset.template_id.clone(), preset);
        }
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(Error::Io)
                    .and_then(|raw| Ok(serde_json::from_str::<EditTemplate>(&raw)?))
                {
                    Ok(template) => {
                        cache.templates.insert(template.template_id.clone(), template);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to load template");
                    }
                }
            }
        }
        cache.loaded = true;
    }
}
