//! Textual dump of a compiled actor set.
//!
//! One section per actor family, each actor followed by its device contexts,
//! store keys, arrows and the sizes and original reference counts of its
//! outputs. Meant for humans; the format is not stable.

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::actor::{Actor, ActorKind, DataSourceKind};
use crate::compiler::ActorSet;
use crate::error::Result;
use crate::store::DeviceTensorStore;

/// Display adapter rendering an actor set.
pub struct ActorSetDump<'a> {
    set: &'a ActorSet,
    loop_count: u64,
    store: Option<&'a DeviceTensorStore>,
}

impl<'a> ActorSetDump<'a> {
    /// Dump `set` as configured for `loop_count` iterations.
    pub fn new(set: &'a ActorSet, loop_count: u64) -> Self {
        Self {
            set,
            loop_count,
            store: None,
        }
    }

    /// Resolve store keys to persistent tensor addresses.
    pub fn with_store(mut self, store: &'a DeviceTensorStore) -> Self {
        self.store = Some(store);
        self
    }

    fn abstract_actor(&self, f: &mut fmt::Formatter<'_>, actor: &Actor) -> fmt::Result {
        let base = &actor.base;
        if !base.device_contexts.is_empty() {
            writeln!(f, "\t\tdevice_contexts:{}", base.device_contexts.len())?;
            for device in &base.device_contexts {
                writeln!(f, "\t\t\tdevice_context:{}", device.key())?;
            }
        }

        if !base.device_tensor_store_keys.is_empty() {
            writeln!(f, "\t\tdevice_tensor_store_keys:{}", base.device_tensor_store_keys.len())?;
            for (index, key) in &base.device_tensor_store_keys {
                write!(f, "\t\t\tto_input_index:{}\tfrom_store_key:{}", index, key)?;
                let persistent = self.store.zip(base.device().ok()).and_then(|(store, device)| {
                    store.fetch(key, device.key())
                });
                match persistent.and_then(|t| t.address()) {
                    Some(address) => writeln!(f, "\tptr:{}", address)?,
                    None => writeln!(f)?,
                }
            }
        }

        if !base.input_data_arrows.is_empty() {
            writeln!(f, "\t\tinput_data_arrow_actors:{}", base.input_data_arrows.len())?;
            for arrow in &base.input_data_arrows {
                writeln!(f, "\t\t\tfrom_actor_name:{}", arrow.from_actor_id)?;
            }
        }

        if !base.input_control_arrows.is_empty() {
            writeln!(f, "\t\tinput_control_arrow_actors:{}", base.input_control_arrows.len())?;
            for from in &base.input_control_arrows {
                writeln!(f, "\t\t\tfrom_actor_name:{}", from)?;
            }
        }

        if !base.output_data_arrows.is_empty() {
            writeln!(f, "\t\toutput_data_arrows:{}", base.output_data_arrows.len())?;
            for arrow in &base.output_data_arrows {
                writeln!(f, "\t\t\t{}", arrow)?;
            }
        }

        if !base.output_control_arrows.is_empty() {
            writeln!(f, "\t\toutput_control_arrows:{}", base.output_control_arrows.len())?;
            for arrow in &base.output_control_arrows {
                writeln!(f, "\t\t\tto_actor_name:{}", arrow.to_actor_id)?;
            }
        }

        if !base.output_result_arrows.is_empty() {
            writeln!(f, "\t\toutput_result_arrows:{}", base.output_result_arrows.len())?;
            for arrow in &base.output_result_arrows {
                writeln!(
                    f,
                    "\t\t\tfrom_output_index:{}\tto_actor_name:{}\toutput_node_position:{}",
                    arrow.from_output_index, arrow.to_actor_id, arrow.position
                )?;
            }
        }
        Ok(())
    }

    fn outputs(&self, f: &mut fmt::Formatter<'_>, actor: &Actor) -> fmt::Result {
        let base = &actor.base;
        for index in 0..base.num_outputs() {
            write!(f, "\t\t\toutput_index:{}\tsize:", index)?;
            match base.output_sizes.get(index).copied().flatten() {
                Some(size) => write!(f, "{}", size)?,
                None => f.write_str("?")?,
            }
            writeln!(f, "\toriginal_ref_count:{}", base.original_ref_count(index))?;
        }
        Ok(())
    }

    fn actor(&self, f: &mut fmt::Formatter<'_>, actor: &Actor) -> fmt::Result {
        writeln!(f, "\tactor_name:{}", actor.id())?;
        match &actor.kind {
            ActorKind::DataSource(source) => match &source.source {
                DataSourceKind::HostQueue { positions, metas } => {
                    writeln!(f, "\t\tdata_nodes:{}", positions.len())?;
                    for (order, (position, meta)) in positions.iter().zip(metas).enumerate() {
                        writeln!(
                            f,
                            "\t\t\tnode_order_number:{}\tinput_position:{}\tmeta:{}",
                            order, position, meta
                        )?;
                    }
                }
                DataSourceKind::DeviceQueue { queue, metas } => {
                    writeln!(
                        f,
                        "\t\tqueue_capacity:{}\toutput_number:{}",
                        queue.capacity(),
                        metas.len()
                    )?;
                }
            },
            ActorKind::Kernel(k) => {
                writeln!(
                    f,
                    "\t\tkernel_name:{}\tinputs_num:{}\toutputs_num:{}",
                    k.kernel.name(),
                    k.kernel.input_size_list().len(),
                    k.kernel.output_size_list().len()
                )?;
            }
            ActorKind::SuperKernel(s) => {
                writeln!(
                    f,
                    "\t\tinputs_num:{}\tkernels_num:{}\toutputs_num:{}",
                    actor.base.input_slots.len(),
                    s.steps.len(),
                    s.outputs.len()
                )?;
                for step in &s.steps {
                    writeln!(f, "\t\t\tkernel_name:{}\tstep:{}", step.kernel.name(), step.name)?;
                }
            }
            ActorKind::Copy(c) => {
                writeln!(f, "\t\ttarget_device_context:{}", c.target.key())?;
            }
            ActorKind::Gather(g) => {
                writeln!(f, "\t\tarity:{}", g.arity)?;
            }
            ActorKind::Switch(s) => {
                writeln!(f, "\t\tbranches:{}\tvalues:{}", s.branches, s.values)?;
                for (branch, arrows) in s.branch_control_arrows.iter().enumerate() {
                    for arrow in arrows {
                        writeln!(f, "\t\t\tbranch:{}\tto_actor_name:{}", branch, arrow.to_actor_id)?;
                    }
                }
            }
            ActorKind::DataPrepare(_) | ActorKind::LoopCount(_) | ActorKind::Output(_) => {}
        }
        self.outputs(f, actor)?;
        self.abstract_actor(f, actor)?;
        writeln!(f)
    }

    fn section<'s>(
        &self,
        f: &mut fmt::Formatter<'_>,
        title: &str,
        actors: impl Iterator<Item = &'s Arc<Actor>>,
    ) -> fmt::Result {
        let actors: Vec<_> = actors.collect();
        write!(f, "\n\n[{}:{}]\n", title, actors.len())?;
        for actor in actors {
            self.actor(f, actor)?;
        }
        Ok(())
    }
}

impl fmt::Display for ActorSetDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.set;
        writeln!(f, "graph_name:{}\tactors:{}\tloop_count:{}", set.name, set.len(), self.loop_count)?;

        let no_input = |a: &&Arc<Actor>| set.no_input_actors.contains(a.id());
        self.section(f, "Data prepare actor", set.of_kind("data_prepare"))?;
        self.section(f, "Data source actors", set.of_kind("data_source"))?;
        self.section(f, "Kernel actors", set.of_kind("kernel").filter(|a| !no_input(a)))?;
        self.section(f, "Super kernel actors", set.of_kind("super_kernel").filter(|a| !no_input(a)))?;
        self.section(
            f,
            "No input kernel actors",
            set.actors().iter().filter(|a| no_input(a)),
        )?;
        self.section(f, "Copy actors", set.of_kind("copy"))?;
        self.section(f, "Gather actors", set.of_kind("gather"))?;
        self.section(f, "Switch actors", set.of_kind("switch"))?;

        write!(f, "\n\n[Loop count actor:1]\n")?;
        if let Some(actor) = set.get(&set.loop_count) {
            writeln!(f, "\tactor_name:{}\tloop_count:{}", actor.id(), self.loop_count)?;
            self.abstract_actor(f, actor)?;
        }

        write!(f, "\n\n[Output actor:1]\n")?;
        if let Some(actor) = set.get(&set.output) {
            writeln!(
                f,
                "\tactor_name:{}\tloop_count:{}\toutputs_num:{}",
                actor.id(),
                self.loop_count,
                set.num_outputs()
            )?;
            self.abstract_actor(f, actor)?;
            let producers: Vec<_> = set
                .actors()
                .iter()
                .filter(|a| !a.base.output_result_arrows.is_empty())
                .collect();
            writeln!(f, "\t\tinput_result_arrows:{}", producers.len())?;
            for producer in producers {
                writeln!(f, "\t\t\tfrom_actor_name:{}", producer.id())?;
            }
        }
        Ok(())
    }
}

/// Render the dump of `set` as a string.
pub fn dump_actor_set(set: &ActorSet, loop_count: u64, store: Option<&DeviceTensorStore>) -> String {
    let dump = ActorSetDump::new(set, loop_count);
    match store {
        Some(store) => dump.with_store(store).to_string(),
        None => dump.to_string(),
    }
}

/// Write the dump to `<dir>/actor_set_<graph>.ir`. Returns the file path.
pub fn write_dump(set: &ActorSet, loop_count: u64, store: Option<&DeviceTensorStore>, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("actor_set_{}.ir", set.name));
    let mut file = fs::File::create(&path)?;
    file.write_all(dump_actor_set(set, loop_count, store).as_bytes())?;
    file.flush()?;
    info!(path = %path.display(), "actor set dumped");
    Ok(path)
}
