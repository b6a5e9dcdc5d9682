//! Forest: the component lifecycle manager.
//!
//! The forest exclusively owns every component instance. It constructs them
//! from a [`Config`], starts them in dependency order (bedrocks and sources
//! first, then trees, treehouses, nims), stops them in reverse, and supports
//! runtime add/remove/pause/resume plus diff-based reload.
//!
//! Reload never mutates a component in place: names present in both configs
//! are left untouched, so reconfiguring a component means remove + add.
//! Individual add/remove failures during reload are logged warnings; the
//! reload itself runs to completion.
//!
//! One mutex guards the whole component table. Critical sections are short;
//! handler threads never take the forest lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use nimsforest_types::{
    ComponentKind, ComponentState, ComponentSummary, ForestError, ForestStatus,
};
use tracing::{info, warn};

use crate::asker::Asker;
use crate::bedrock::{Bedrock, GitBedrock, UnixBedrock};
use crate::broker::FabricHandles;
use crate::cancel::CancelToken;
use crate::config::{
    BedrockConfig, Config, NimConfig, SourceConfig, TreeConfig, TreeHouseConfig, validate_bedrock,
    validate_nim, validate_source, validate_tree, validate_treehouse,
};
use crate::decomposer::{Decomposer, DecomposerConfig};
use crate::nim::Nim;
use crate::source::{Source, SourceFactory, WebhookServer};
use crate::tree::Tree;
use crate::treehouse::TreeHouse;

struct Slot<T> {
    component: T,
    state: ComponentState,
}

impl<T> Slot<T> {
    fn new(component: T) -> Self {
        Self {
            component,
            state: ComponentState::Created,
        }
    }
}

struct ForestState {
    running: bool,
    config: Config,
    config_path: Option<PathBuf>,
    handles: FabricHandles,
    asker: Arc<dyn Asker>,
    factory: SourceFactory,
    webhooks: WebhookServer,
    cancel: CancelToken,
    decomposer: Decomposer,
    sources: BTreeMap<String, Slot<Box<dyn Source>>>,
    trees: BTreeMap<String, Slot<Tree>>,
    treehouses: BTreeMap<String, Slot<TreeHouse>>,
    nims: BTreeMap<String, Slot<Nim>>,
    bedrocks: BTreeMap<String, Slot<Box<dyn Bedrock>>>,
}

/// The lifecycle manager.
pub struct Forest {
    state: Mutex<ForestState>,
}

impl Forest {
    /// Construct every component described by the config. Fails on the first
    /// component that cannot be built (the config itself was validated at
    /// load time, but scripts and prompts must exist on disk).
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        handles: FabricHandles,
        asker: Arc<dyn Asker>,
        factory: SourceFactory,
        webhook_addr: String,
    ) -> Result<Self> {
        let webhooks = WebhookServer::new(webhook_addr);
        let decomposer = Decomposer::new(
            DecomposerConfig::named(format!(
                "decomposer-{}",
                crate::bedrock::LockManager::holder_identity()
            )),
            handles.humus.clone(),
            handles.soil.clone(),
        );

        let mut state = ForestState {
            running: false,
            config: config.clone(),
            config_path,
            handles,
            asker,
            factory,
            webhooks,
            cancel: CancelToken::new(),
            decomposer,
            sources: BTreeMap::new(),
            trees: BTreeMap::new(),
            treehouses: BTreeMap::new(),
            nims: BTreeMap::new(),
            bedrocks: BTreeMap::new(),
        };

        for (name, c) in &config.bedrocks {
            let bedrock = build_bedrock(c, &state.handles)
                .with_context(|| format!("failed to build bedrock {}", name))?;
            state.bedrocks.insert(name.clone(), Slot::new(bedrock));
        }
        for (name, c) in &config.sources {
            let source = build_source(&state, c)
                .with_context(|| format!("failed to build source {}", name))?;
            state.sources.insert(name.clone(), Slot::new(source));
        }
        for (name, c) in &config.trees {
            let tree = build_tree(c, &state.handles)
                .with_context(|| format!("failed to build tree {}", name))?;
            state.trees.insert(name.clone(), Slot::new(tree));
        }
        for (name, c) in &config.treehouses {
            let treehouse = build_treehouse(c, &state.handles)
                .with_context(|| format!("failed to build treehouse {}", name))?;
            state.treehouses.insert(name.clone(), Slot::new(treehouse));
        }
        for (name, c) in &config.nims {
            let nim = build_nim(c, &state.handles, &state.asker)
                .with_context(|| format!("failed to build nim {}", name))?;
            state.nims.insert(name.clone(), Slot::new(nim));
        }

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Start everything in dependency order.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Ok(());
        }
        state.cancel = CancelToken::new();
        let cancel = state.cancel.clone();
        let wind = state.handles.wind.clone();

        for (name, slot) in state.bedrocks.iter_mut() {
            slot.component
                .start(&wind, cancel.clone())
                .with_context(|| format!("failed to start bedrock {}", name))?;
            slot.state = ComponentState::Running;
        }
        for (name, slot) in state.sources.iter_mut() {
            slot.component
                .start(cancel.clone())
                .with_context(|| format!("failed to start source {}", name))?;
            slot.state = ComponentState::Running;
        }
        for (name, slot) in state.trees.iter_mut() {
            slot.component
                .start(cancel.clone())
                .with_context(|| format!("failed to start tree {}", name))?;
            slot.state = ComponentState::Running;
        }
        for (name, slot) in state.treehouses.iter_mut() {
            slot.component
                .start(cancel.clone())
                .with_context(|| format!("failed to start treehouse {}", name))?;
            slot.state = ComponentState::Running;
        }
        for (name, slot) in state.nims.iter_mut() {
            slot.component
                .start(cancel.clone())
                .with_context(|| format!("failed to start nim {}", name))?;
            slot.state = ComponentState::Running;
        }

        state.decomposer.start(cancel)?;
        state.running = true;
        info!("forest started");
        Ok(())
    }

    /// Stop everything in reverse dependency order.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        state.cancel.cancel();

        for slot in state.nims.values_mut() {
            slot.component.stop();
            slot.state = ComponentState::Stopped;
        }
        for slot in state.treehouses.values_mut() {
            slot.component.stop();
            slot.state = ComponentState::Stopped;
        }
        for slot in state.trees.values_mut() {
            slot.component.stop();
            slot.state = ComponentState::Stopped;
        }
        for slot in state.sources.values_mut() {
            slot.component.stop();
            slot.state = ComponentState::Stopped;
        }
        for slot in state.bedrocks.values_mut() {
            slot.component.stop();
            slot.state = ComponentState::Stopped;
        }
        state.decomposer.stop();
        state.webhooks.stop();
        state.running = false;
        info!("forest stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Shared fabric handles (for the viewmodel publisher and tests).
    pub fn fabric(&self) -> FabricHandles {
        self.state.lock().unwrap().handles.clone()
    }

    /// Bound address of the shared webhook server, once a webhook source has
    /// started it.
    pub fn webhook_local_addr(&self) -> Option<std::net::SocketAddr> {
        self.state.lock().unwrap().webhooks.local_addr()
    }

    // --- runtime add/remove ---

    pub fn add_source(&self, config: SourceConfig) -> Result<()> {
        validate_source(&config)?;
        let mut state = self.state.lock().unwrap();
        if state.sources.contains_key(&config.name) {
            return Err(ForestError::AlreadyExists(format!("source {}", config.name)).into());
        }
        let mut source = build_source(&state, &config)?;
        let mut slot_state = ComponentState::Created;
        if state.running {
            source.start(state.cancel.clone())?;
            slot_state = ComponentState::Running;
        }
        state.sources.insert(
            config.name.clone(),
            Slot {
                component: source,
                state: slot_state,
            },
        );
        state.config.sources.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut slot = state
            .sources
            .remove(name)
            .ok_or_else(|| ForestError::NotFound(format!("source {}", name)))?;
        slot.component.stop();
        state.config.sources.remove(name);
        Ok(())
    }

    pub fn add_tree(&self, config: TreeConfig) -> Result<()> {
        validate_tree(&config)?;
        let mut state = self.state.lock().unwrap();
        if state.trees.contains_key(&config.name) {
            return Err(ForestError::AlreadyExists(format!("tree {}", config.name)).into());
        }
        let mut tree = build_tree(&config, &state.handles)?;
        let mut slot_state = ComponentState::Created;
        if state.running {
            tree.start(state.cancel.clone())?;
            slot_state = ComponentState::Running;
        }
        state.trees.insert(
            config.name.clone(),
            Slot {
                component: tree,
                state: slot_state,
            },
        );
        state.config.trees.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_tree(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut slot = state
            .trees
            .remove(name)
            .ok_or_else(|| ForestError::NotFound(format!("tree {}", name)))?;
        slot.component.stop();
        state.config.trees.remove(name);
        Ok(())
    }

    pub fn add_treehouse(&self, config: TreeHouseConfig) -> Result<()> {
        validate_treehouse(&config)?;
        let mut state = self.state.lock().unwrap();
        if state.treehouses.contains_key(&config.name) {
            return Err(ForestError::AlreadyExists(format!("treehouse {}", config.name)).into());
        }
        let mut treehouse = build_treehouse(&config, &state.handles)?;
        let mut slot_state = ComponentState::Created;
        if state.running {
            treehouse.start(state.cancel.clone())?;
            slot_state = ComponentState::Running;
        }
        state.treehouses.insert(
            config.name.clone(),
            Slot {
                component: treehouse,
                state: slot_state,
            },
        );
        state.config.treehouses.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_treehouse(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut slot = state
            .treehouses
            .remove(name)
            .ok_or_else(|| ForestError::NotFound(format!("treehouse {}", name)))?;
        slot.component.stop();
        state.config.treehouses.remove(name);
        Ok(())
    }

    pub fn add_nim(&self, config: NimConfig) -> Result<()> {
        validate_nim(&config)?;
        let mut state = self.state.lock().unwrap();
        if state.nims.contains_key(&config.name) {
            return Err(ForestError::AlreadyExists(format!("nim {}", config.name)).into());
        }
        let mut nim = build_nim(&config, &state.handles, &state.asker)?;
        let mut slot_state = ComponentState::Created;
        if state.running {
            nim.start(state.cancel.clone())?;
            slot_state = ComponentState::Running;
        }
        state.nims.insert(
            config.name.clone(),
            Slot {
                component: nim,
                state: slot_state,
            },
        );
        state.config.nims.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_nim(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut slot = state
            .nims
            .remove(name)
            .ok_or_else(|| ForestError::NotFound(format!("nim {}", name)))?;
        slot.component.stop();
        state.config.nims.remove(name);
        Ok(())
    }

    pub fn add_bedrock(&self, config: BedrockConfig) -> Result<()> {
        validate_bedrock(&config)?;
        let mut state = self.state.lock().unwrap();
        if state.bedrocks.contains_key(&config.name) {
            return Err(ForestError::AlreadyExists(format!("bedrock {}", config.name)).into());
        }
        let mut bedrock = build_bedrock(&config, &state.handles)?;
        let mut slot_state = ComponentState::Created;
        if state.running {
            let wind = state.handles.wind.clone();
            bedrock.start(&wind, state.cancel.clone())?;
            slot_state = ComponentState::Running;
        }
        state.bedrocks.insert(
            config.name.clone(),
            Slot {
                component: bedrock,
                state: slot_state,
            },
        );
        state.config.bedrocks.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_bedrock(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut slot = state
            .bedrocks
            .remove(name)
            .ok_or_else(|| ForestError::NotFound(format!("bedrock {}", name)))?;
        slot.component.stop();
        state.config.bedrocks.remove(name);
        Ok(())
    }

    // --- pause/resume ---

    pub fn pause_tree(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .trees
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("tree {}", name)))?;
        slot.component.stop();
        slot.state = ComponentState::Paused;
        Ok(())
    }

    pub fn resume_tree(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cancel = state.cancel.clone();
        let slot = state
            .trees
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("tree {}", name)))?;
        slot.component.start(cancel)?;
        slot.state = ComponentState::Running;
        Ok(())
    }

    pub fn pause_treehouse(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .treehouses
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("treehouse {}", name)))?;
        slot.component.stop();
        slot.state = ComponentState::Paused;
        Ok(())
    }

    pub fn resume_treehouse(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cancel = state.cancel.clone();
        let slot = state
            .treehouses
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("treehouse {}", name)))?;
        slot.component.start(cancel)?;
        slot.state = ComponentState::Running;
        Ok(())
    }

    pub fn pause_nim(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .nims
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("nim {}", name)))?;
        slot.component.stop();
        slot.state = ComponentState::Paused;
        Ok(())
    }

    pub fn resume_nim(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cancel = state.cancel.clone();
        let slot = state
            .nims
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("nim {}", name)))?;
        slot.component.start(cancel)?;
        slot.state = ComponentState::Running;
        Ok(())
    }

    pub fn pause_source(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .sources
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("source {}", name)))?;
        slot.component.stop();
        slot.state = ComponentState::Paused;
        Ok(())
    }

    pub fn resume_source(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let cancel = state.cancel.clone();
        let slot = state
            .sources
            .get_mut(name)
            .ok_or_else(|| ForestError::NotFound(format!("source {}", name)))?;
        slot.component.start(cancel)?;
        slot.state = ComponentState::Running;
        Ok(())
    }

    // --- reload ---

    /// Diff a new config against the running set. Removed names stop and
    /// drop; added names build and (when running) start; unchanged names are
    /// left alone. Failures are warnings; the reload runs to completion.
    pub fn reload(&self, new_config: Config) {
        let removed_sources: Vec<String>;
        let removed_trees: Vec<String>;
        let removed_treehouses: Vec<String>;
        let removed_nims: Vec<String>;
        let removed_bedrocks: Vec<String>;
        {
            let state = self.state.lock().unwrap();
            removed_sources = missing_keys(&state.config.sources, &new_config.sources);
            removed_trees = missing_keys(&state.config.trees, &new_config.trees);
            removed_treehouses = missing_keys(&state.config.treehouses, &new_config.treehouses);
            removed_nims = missing_keys(&state.config.nims, &new_config.nims);
            removed_bedrocks = missing_keys(&state.config.bedrocks, &new_config.bedrocks);
        }

        for name in removed_nims {
            if let Err(e) = self.remove_nim(&name) {
                warn!(nim = %name, "reload: remove failed: {:#}", e);
            }
        }
        for name in removed_treehouses {
            if let Err(e) = self.remove_treehouse(&name) {
                warn!(treehouse = %name, "reload: remove failed: {:#}", e);
            }
        }
        for name in removed_trees {
            if let Err(e) = self.remove_tree(&name) {
                warn!(tree = %name, "reload: remove failed: {:#}", e);
            }
        }
        for name in removed_sources {
            if let Err(e) = self.remove_source(&name) {
                warn!(source = %name, "reload: remove failed: {:#}", e);
            }
        }
        for name in removed_bedrocks {
            if let Err(e) = self.remove_bedrock(&name) {
                warn!(bedrock = %name, "reload: remove failed: {:#}", e);
            }
        }

        for (name, c) in new_config.bedrocks {
            if !self.has_bedrock(&name) {
                if let Err(e) = self.add_bedrock(c) {
                    warn!(bedrock = %name, "reload: add failed: {:#}", e);
                }
            }
        }
        for (name, c) in new_config.sources {
            if !self.has_source(&name) {
                if let Err(e) = self.add_source(c) {
                    warn!(source = %name, "reload: add failed: {:#}", e);
                }
            }
        }
        for (name, c) in new_config.trees {
            if !self.has_tree(&name) {
                if let Err(e) = self.add_tree(c) {
                    warn!(tree = %name, "reload: add failed: {:#}", e);
                }
            }
        }
        for (name, c) in new_config.treehouses {
            if !self.has_treehouse(&name) {
                if let Err(e) = self.add_treehouse(c) {
                    warn!(treehouse = %name, "reload: add failed: {:#}", e);
                }
            }
        }
        for (name, c) in new_config.nims {
            if !self.has_nim(&name) {
                if let Err(e) = self.add_nim(c) {
                    warn!(nim = %name, "reload: add failed: {:#}", e);
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.config.viewer = new_config.viewer;
        state.config.songbirds = new_config.songbirds;
        state.config.flowerbeds = new_config.flowerbeds;
        info!("reload complete");
    }

    /// Reload from the config file the forest was loaded from.
    pub fn reload_from_disk(&self) -> Result<()> {
        let path = {
            let state = self.state.lock().unwrap();
            state
                .config_path
                .clone()
                .context("forest was not loaded from a config file")?
        };
        let new_config = crate::config::load_config(&path)?;
        self.reload(new_config);
        Ok(())
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.state.lock().unwrap().sources.contains_key(name)
    }

    pub fn has_tree(&self, name: &str) -> bool {
        self.state.lock().unwrap().trees.contains_key(name)
    }

    pub fn has_treehouse(&self, name: &str) -> bool {
        self.state.lock().unwrap().treehouses.contains_key(name)
    }

    pub fn has_nim(&self, name: &str) -> bool {
        self.state.lock().unwrap().nims.contains_key(name)
    }

    pub fn has_bedrock(&self, name: &str) -> bool {
        self.state.lock().unwrap().bedrocks.contains_key(name)
    }

    /// Full status snapshot for the control plane.
    pub fn status(&self) -> ForestStatus {
        let state = self.state.lock().unwrap();
        ForestStatus {
            running: state.running,
            sources: state
                .sources
                .iter()
                .map(|(name, slot)| ComponentSummary {
                    name: name.clone(),
                    kind: ComponentKind::Source,
                    subject: slot.component.publishes().to_string(),
                    state: slot.state,
                })
                .collect(),
            trees: state
                .trees
                .iter()
                .map(|(name, slot)| ComponentSummary {
                    name: name.clone(),
                    kind: ComponentKind::Tree,
                    subject: slot.component.publishes().to_string(),
                    state: slot.state,
                })
                .collect(),
            treehouses: state
                .treehouses
                .iter()
                .map(|(name, slot)| ComponentSummary {
                    name: name.clone(),
                    kind: ComponentKind::TreeHouse,
                    subject: slot.component.publishes().to_string(),
                    state: slot.state,
                })
                .collect(),
            nims: state
                .nims
                .iter()
                .map(|(name, slot)| ComponentSummary {
                    name: name.clone(),
                    kind: ComponentKind::Nim,
                    subject: slot.component.publishes().to_string(),
                    state: slot.state,
                })
                .collect(),
            bedrocks: state
                .bedrocks
                .iter()
                .map(|(name, slot)| ComponentSummary {
                    name: name.clone(),
                    kind: ComponentKind::Bedrock,
                    subject: format!("bedrock.{}.>", name),
                    state: slot.state,
                })
                .collect(),
            config_path: state
                .config_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

fn missing_keys<T>(old: &BTreeMap<String, T>, new: &BTreeMap<String, T>) -> Vec<String> {
    old.keys().filter(|k| !new.contains_key(*k)).cloned().collect()
}

fn build_source(state: &ForestState, config: &SourceConfig) -> Result<Box<dyn Source>> {
    state.factory.build(
        config,
        &state.handles.river,
        &state.handles.soil,
        &state.webhooks,
    )
}

fn build_tree(config: &TreeConfig, handles: &FabricHandles) -> Result<Tree> {
    Tree::new(config, handles.wind.clone(), handles.river.clone())
}

fn build_treehouse(config: &TreeHouseConfig, handles: &FabricHandles) -> Result<TreeHouse> {
    TreeHouse::new(config, handles.wind.clone())
}

fn build_nim(config: &NimConfig, handles: &FabricHandles, asker: &Arc<dyn Asker>) -> Result<Nim> {
    Nim::new(
        config,
        handles.wind.clone(),
        Arc::clone(asker),
        Some(handles.humus.clone()),
    )
}

fn build_bedrock(config: &BedrockConfig, handles: &FabricHandles) -> Result<Box<dyn Bedrock>> {
    match config.kind.as_str() {
        "unix" => Ok(Box::new(UnixBedrock::new(config)?)),
        "git" => Ok(Box::new(GitBedrock::new(
            config,
            Some(handles.soil.clone()),
        )?)),
        other => anyhow::bail!("bedrock {}: unknown type {:?}", config.name, other),
    }
}
