//! Pipeline orchestrator: resolves STT/LLM/TTS adapters per call.
//!
//! Startup runs two passes over the configured pipelines: a factory
//! existence check (hard failure) and a best-effort connectivity probe
//! whose failures are logged but never remove a pipeline from service:
//! local providers routinely fail a boot-time probe yet work at runtime
//! through container DNS.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::{Config, PipelineEntry};
use crate::error::{VoiceBridgeError, VoiceBridgeResult};
use crate::pipeline::{
    local::register_local_factories, placeholder_factory, ComponentAdapter, ComponentFactory,
    ComponentOptions, ComponentRole, LlmComponent, SttComponent, TtsComponent,
};

/// Provider names that get placeholder registrations out of the box.
const DEFAULT_PROVIDERS: [&str; 6] = [
    "local",
    "deepgram",
    "openai",
    "openai_realtime",
    "google",
    "elevenlabs",
];

/// Snapshot of the adapters assigned to one call.
pub struct PipelineResolution {
    pub call_id: String,
    pub pipeline_name: String,
    pub stt_key: String,
    pub stt: Arc<dyn SttComponent>,
    pub stt_options: ComponentOptions,
    pub llm_key: String,
    pub llm: Arc<dyn LlmComponent>,
    pub llm_options: ComponentOptions,
    pub tts_key: String,
    pub tts: Arc<dyn TtsComponent>,
    pub tts_options: ComponentOptions,
    pub primary_provider: Option<String>,
    pub prepared: bool,
    /// Tool allowlist from the pipeline entry; `None` allows all tools.
    pub tool_allowlist: Option<Vec<String>>,
}

impl PipelineResolution {
    /// Key summary for logs.
    pub fn component_summary(&self) -> String {
        format!(
            "stt={}, llm={}, tts={}",
            self.stt_key, self.llm_key, self.tts_key
        )
    }
}

/// Resolves STT/LLM/TTS adapters for calls based on pipeline config.
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    registry: RwLock<HashMap<String, ComponentFactory>>,
    assignments: DashMap<String, Arc<PipelineResolution>>,
    started: AtomicBool,
    active_pipeline: Option<String>,
}

impl PipelineOrchestrator {
    pub fn new(config: Arc<Config>) -> Self {
        let mut registry: HashMap<String, ComponentFactory> = HashMap::new();
        for provider in DEFAULT_PROVIDERS {
            for role in [ComponentRole::Stt, ComponentRole::Llm, ComponentRole::Tts] {
                registry.insert(
                    format!("{provider}_{}", role.as_str()),
                    placeholder_factory(role),
                );
            }
        }
        for role in [ComponentRole::Stt, ComponentRole::Llm, ComponentRole::Tts] {
            registry.insert(format!("*_{}", role.as_str()), placeholder_factory(role));
        }
        register_local_factories(&config, &mut registry);

        let active_pipeline = config.active_pipeline.clone();
        Self {
            config,
            registry: RwLock::new(registry),
            assignments: DashMap::new(),
            started: AtomicBool::new(false),
            active_pipeline,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.config.pipelines.is_empty()
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Replaces or adds a factory. Used by embedders to supply concrete
    /// adapters beyond the built-ins.
    pub fn register_factory(&self, component_key: &str, factory: ComponentFactory) {
        self.registry
            .write()
            .insert(component_key.to_string(), factory);
    }

    /// Two-pass startup: validate factories, then probe connectivity.
    pub async fn start(&self) -> VoiceBridgeResult<()> {
        if !self.enabled() {
            log::info!("[Pipeline] Orchestrator disabled - no pipelines configured");
            return Ok(());
        }

        for (name, entry) in &self.config.pipelines {
            self.validate_entry(name, entry)?;
        }

        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        for (name, entry) in &self.config.pipelines {
            let failures = self.probe_connectivity(name, entry).await;
            if failures.is_empty() {
                healthy += 1;
            } else {
                unhealthy += 1;
                // Do not remove the pipeline: a boot-time probe failure is
                // not proof it will fail at call time.
                log::warn!(
                    "[Pipeline] Validation failed, pipeline stays available: pipeline={name}, failures={failures:?}"
                );
            }
        }

        self.started.store(true, Ordering::SeqCst);
        log::info!(
            "[Pipeline] Orchestrator initialized: active={:?}, pipelines={}, healthy={healthy}, unhealthy={unhealthy}",
            self.active_pipeline,
            self.config.pipelines.len(),
        );
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let call_ids: Vec<String> = self.assignments.iter().map(|e| e.key().clone()).collect();
        for call_id in call_ids {
            self.release_pipeline(&call_id).await;
        }
        log::info!("[Pipeline] Orchestrator stopped");
    }

    /// Memoized per-call resolution. Returns `None` when pipelines are not
    /// configured/started or nothing can be selected.
    pub fn get_pipeline(
        &self,
        call_id: &str,
        pipeline_name: Option<&str>,
    ) -> Option<Arc<PipelineResolution>> {
        if !self.enabled() {
            return None;
        }
        if !self.started() {
            log::debug!("[Pipeline] Requested before start; skipping resolution: call={call_id}");
            return None;
        }
        if let Some(existing) = self.assignments.get(call_id) {
            return Some(Arc::clone(&existing));
        }

        let pipelines = &self.config.pipelines;
        let requested = pipeline_name
            .map(str::to_string)
            .or_else(|| self.active_pipeline.clone());

        let (selected_name, entry) = match requested {
            Some(name) => match pipelines.get(&name) {
                Some(entry) => (name, entry),
                None => {
                    log::warn!(
                        "[Pipeline] Requested pipeline not found; using first available: call={call_id}, requested={name}"
                    );
                    pipelines
                        .iter()
                        .next()
                        .map(|(n, e)| (n.clone(), e))?
                }
            },
            None => pipelines.iter().next().map(|(n, e)| (n.clone(), e))?,
        };

        let resolution = Arc::new(self.build_resolution(call_id, &selected_name, entry));
        log::info!(
            "[Pipeline] Assigned: call={call_id}, pipeline={selected_name}, {}",
            resolution.component_summary()
        );
        self.assignments
            .insert(call_id.to_string(), Arc::clone(&resolution));
        Some(resolution)
    }

    /// Releases a call's adapters: `close_call` first, then `stop`, both
    /// tolerant of placeholders.
    pub async fn release_pipeline(&self, call_id: &str) {
        let Some((_, resolution)) = self.assignments.remove(call_id) else {
            return;
        };
        resolution.stt.close_call(call_id).await;
        resolution.llm.close_call(call_id).await;
        resolution.tts.close_call(call_id).await;
        resolution.stt.stop().await;
        resolution.llm.stop().await;
        resolution.tts.stop().await;
        log::debug!(
            "[Pipeline] Released: call={call_id}, pipeline={}",
            resolution.pipeline_name
        );
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn validate_entry(&self, name: &str, entry: &PipelineEntry) -> VoiceBridgeResult<()> {
        let slots = [
            (&entry.stt, ComponentRole::Stt),
            (&entry.llm, ComponentRole::Llm),
            (&entry.tts, ComponentRole::Tts),
        ];
        for (key, expected) in slots {
            let Some(role) = ComponentRole::from_key(key) else {
                return Err(VoiceBridgeError::Configuration(format!(
                    "pipeline '{name}': invalid component key '{key}' \
                     (expected '<provider>_<role>' with role stt|llm|tts)"
                )));
            };
            // Existence is satisfied by the wildcard; a mismatch between
            // the key's role and the slot it is wired into is a config error.
            if role != expected {
                return Err(VoiceBridgeError::Configuration(format!(
                    "pipeline '{name}': component '{key}' has role '{}' but is wired into the '{}' slot",
                    role.as_str(),
                    expected.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn probe_connectivity(&self, name: &str, entry: &PipelineEntry) -> Vec<String> {
        let mut failures = Vec::new();
        let resolution = self.build_resolution("validation", name, entry);
        if let Err(e) = resolution
            .stt
            .validate_connectivity(&resolution.stt_options)
            .await
        {
            failures.push(format!("stt({}): {e}", resolution.stt_key));
        }
        if let Err(e) = resolution
            .llm
            .validate_connectivity(&resolution.llm_options)
            .await
        {
            failures.push(format!("llm({}): {e}", resolution.llm_key));
        }
        if let Err(e) = resolution
            .tts
            .validate_connectivity(&resolution.tts_options)
            .await
        {
            failures.push(format!("tts({}): {e}", resolution.tts_key));
        }
        failures
    }

    fn resolve_factory(&self, component_key: &str, role: ComponentRole) -> ComponentFactory {
        let registry = self.registry.read();
        if let Some(factory) = registry.get(component_key) {
            return Arc::clone(factory);
        }
        let wildcard = format!("*_{}", role.as_str());
        registry
            .get(&wildcard)
            .map(Arc::clone)
            .unwrap_or_else(|| placeholder_factory(role))
    }

    fn build_resolution(
        &self,
        call_id: &str,
        pipeline_name: &str,
        entry: &PipelineEntry,
    ) -> PipelineResolution {
        let build = |key: &str, role: ComponentRole, options: &ComponentOptions| {
            let factory = self.resolve_factory(key, role);
            let adapter = factory(key, options.clone());
            if adapter.role() != role {
                log::error!(
                    "[Pipeline] Factory for '{key}' produced a {} adapter; replacing with placeholder",
                    adapter.role().as_str()
                );
                return placeholder_factory(role)(key, options.clone());
            }
            adapter
        };

        let stt_adapter = build(&entry.stt, ComponentRole::Stt, &entry.options.stt);
        let llm_adapter = build(&entry.llm, ComponentRole::Llm, &entry.options.llm);
        let tts_adapter = build(&entry.tts, ComponentRole::Tts, &entry.options.tts);

        let (ComponentAdapter::Stt(stt), ComponentAdapter::Llm(llm), ComponentAdapter::Tts(tts)) =
            (stt_adapter, llm_adapter, tts_adapter)
        else {
            unreachable!("build() guarantees role-matched adapters");
        };

        // Primary provider: the STT key's provider prefix, used for tool
        // schema selection.
        let primary_provider = entry
            .stt
            .rsplit_once('_')
            .map(|(provider, _)| provider.to_string());

        PipelineResolution {
            call_id: call_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            stt_key: entry.stt.clone(),
            stt,
            stt_options: entry.options.stt.clone(),
            llm_key: entry.llm.clone(),
            llm,
            llm_options: entry.options.llm.clone(),
            tts_key: entry.tts.clone(),
            tts,
            tts_options: entry.options.tts.clone(),
            primary_provider,
            prepared: true,
            tool_allowlist: entry.tools.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineOptions;
    use crate::pipeline::LlmContext;
    use async_trait::async_trait;

    fn config_with_pipeline(name: &str, stt: &str, llm: &str, tts: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.pipelines.insert(
            name.to_string(),
            PipelineEntry {
                stt: stt.to_string(),
                llm: llm.to_string(),
                tts: tts.to_string(),
                options: PipelineOptions::default(),
                tools: Some(vec!["transfer".to_string()]),
            },
        );
        config.active_pipeline = Some(name.to_string());
        Arc::new(config)
    }

    #[tokio::test]
    async fn disabled_without_pipelines() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(Config::default()));
        assert!(!orchestrator.enabled());
        orchestrator.start().await.unwrap();
        assert!(orchestrator.get_pipeline("c1", None).is_none());
    }

    #[tokio::test]
    async fn resolution_is_memoized_per_call() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "default",
            "local_stt",
            "local_llm",
            "local_tts",
        ));
        orchestrator.start().await.unwrap();

        let first = orchestrator.get_pipeline("c1", None).unwrap();
        let second = orchestrator.get_pipeline("c1", None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pipeline_name, "default");
        assert_eq!(first.tool_allowlist.as_deref(), Some(&["transfer".to_string()][..]));
    }

    #[tokio::test]
    async fn unknown_pipeline_falls_back_to_first() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "only",
            "local_stt",
            "local_llm",
            "local_tts",
        ));
        orchestrator.start().await.unwrap();

        let resolution = orchestrator.get_pipeline("c1", Some("ghost")).unwrap();
        assert_eq!(resolution.pipeline_name, "only");
    }

    #[tokio::test]
    async fn unknown_provider_resolves_to_wildcard_placeholder() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "default",
            "nobody_stt",
            "nobody_llm",
            "nobody_tts",
        ));
        orchestrator.start().await.unwrap();

        let resolution = orchestrator.get_pipeline("c1", None).unwrap();
        let err = resolution
            .llm
            .generate("c1", "hello", &LlmContext::default(), &ComponentOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nobody_llm"));
    }

    #[tokio::test]
    async fn invalid_component_key_fails_start() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "broken",
            "local", // missing role suffix
            "local_llm",
            "local_tts",
        ));
        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, VoiceBridgeError::Configuration(_)));
    }

    #[tokio::test]
    async fn role_slot_mismatch_fails_start() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "crossed",
            "local_tts", // TTS key in the STT slot
            "local_llm",
            "local_tts",
        ));
        assert!(orchestrator.start().await.is_err());
    }

    #[tokio::test]
    async fn release_tolerates_placeholders_and_forgets_call() {
        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "default",
            "local_stt",
            "local_llm",
            "local_tts",
        ));
        orchestrator.start().await.unwrap();

        let first = orchestrator.get_pipeline("c1", None).unwrap();
        orchestrator.release_pipeline("c1").await;

        // A fresh resolution is built after release.
        let second = orchestrator.get_pipeline("c1", None).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn custom_factory_overrides_builtin() {
        struct CannedLlm;

        #[async_trait]
        impl LlmComponent for CannedLlm {
            async fn generate(
                &self,
                _call_id: &str,
                _transcript: &str,
                _context: &LlmContext,
                _options: &ComponentOptions,
            ) -> crate::error::ProviderResult<String> {
                Ok("canned".to_string())
            }
        }

        let orchestrator = PipelineOrchestrator::new(config_with_pipeline(
            "default",
            "local_stt",
            "canned_llm",
            "local_tts",
        ));
        orchestrator.register_factory(
            "canned_llm",
            Arc::new(|_key, _options| ComponentAdapter::Llm(Arc::new(CannedLlm))),
        );
        orchestrator.start().await.unwrap();

        let resolution = orchestrator.get_pipeline("c1", None).unwrap();
        let reply = resolution
            .llm
            .generate("c1", "hi", &LlmContext::default(), &ComponentOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, "canned");
    }
}
