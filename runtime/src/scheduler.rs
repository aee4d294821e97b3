//! The tick scheduler.
//!
//! Each tick steps every live organism once, in parallel, against a grid
//! that is read-only for the duration of the parallel phase. Every grid
//! write an organism performs is queued in its step context and made
//! visible to that organism alone through a read-your-writes overlay.
//! After the workers join, the scheduler commits the queued writes
//! serially in `(organism_id, write_seq)` order, applies births and
//! deaths, and reports the changed cells. The visible outcome is therefore
//! as if organisms stepped one after another in id order, independent of
//! the worker count. That is the determinism property the capture tests
//! pin down.

use crate::isa;
use crate::organism::Organism;
use crate::program::Program;
use evochora_app_config::{SimulationConfig, ThermodynamicsConfig, TopologyKind};
use evochora_environment::{Environment, EnvironmentError};
use evochora_logger::{debug, info};
use evochora_types::{Coord, Molecule, MoleculeType, OrganismId, Shape, Topology};
use evochora_worker_pool::WorkerPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// One queued grid write.
struct CellWrite {
    seq: u32,
    flat: usize,
    word: u32,
}

/// A spawn requested during the parallel phase.
pub(crate) struct BirthRequest {
    position: Coord,
    energy: i32,
    dv: Coord,
}

/// Everything one organism step may read and queue.
pub(crate) struct StepCtx<'a> {
    pub(crate) env: &'a Environment,
    pub(crate) thermo: &'a ThermodynamicsConfig,
    pub(crate) stack_limit: usize,
    pub(crate) dims: usize,
    /// Cells owned by the stepping organism at the start of the tick.
    owned: Option<&'a BTreeSet<usize>>,
    /// Queued writes, applied serially after the parallel phase.
    writes: Vec<CellWrite>,
    /// Read-your-writes overlay keyed by flat index.
    overlay: HashMap<usize, u32>,
    births: Vec<BirthRequest>,
}

impl<'a> StepCtx<'a> {
    fn new(
        env: &'a Environment,
        thermo: &'a ThermodynamicsConfig,
        stack_limit: usize,
        owned: Option<&'a BTreeSet<usize>>,
    ) -> StepCtx<'a> {
        StepCtx {
            env,
            thermo,
            stack_limit,
            dims: env.num_dims(),
            owned,
            writes: Vec::new(),
            overlay: HashMap::new(),
            births: Vec::new(),
        }
    }

    /// Wraps a coordinate, failing on a bounded grid.
    pub(crate) fn wrap(&self, coord: &[i32]) -> Result<Coord, EnvironmentError> {
        self.env.wrap(coord)
    }

    /// Wraps a coordinate, passing it through unchanged when it cannot be
    /// wrapped (the next fetch will fail instead).
    pub(crate) fn wrap_or_keep(&self, coord: Coord) -> Coord {
        self.env.wrap(&coord).unwrap_or(coord)
    }

    /// Reads a cell, seeing this organism's own queued writes.
    pub(crate) fn read(
        &self,
        coord: &[i32],
    ) -> Result<(Molecule, OrganismId), EnvironmentError> {
        let wrapped = self.env.wrap(coord)?;
        let flat = self.env.shape().flat_index(&wrapped);
        let word = match self.overlay.get(&flat) {
            Some(word) => *word,
            None => self.env.raw(flat),
        };
        Ok(Molecule::decode(word)?)
    }

    /// Queues a write; it commits after the parallel phase.
    pub(crate) fn write(
        &mut self,
        coord: &[i32],
        molecule: Molecule,
        owner: OrganismId,
    ) -> Result<(), EnvironmentError> {
        let wrapped = self.env.wrap(coord)?;
        let flat = self.env.shape().flat_index(&wrapped);
        let word = molecule.encode(owner);
        self.overlay.insert(flat, word);
        self.writes.push(CellWrite {
            seq: self.writes.len() as u32,
            flat,
            word,
        });
        Ok(())
    }

    /// Queues a birth; ids are assigned at commit.
    pub(crate) fn spawn(&mut self, position: Coord, energy: i32, dv: Coord) {
        self.births.push(BirthRequest {
            position,
            energy,
            dv,
        });
    }

    /// Finds the owned LABEL cell matching a 19-bit hash.
    ///
    /// Searches the start-of-tick ownership snapshot in flat-index order,
    /// so the answer is the same for every worker layout.
    pub(crate) fn find_label(&self, hash: i32) -> Option<Coord> {
        let owned = self.owned?;
        for flat in owned {
            if let Ok((molecule, _)) = Molecule::decode(self.env.raw(*flat)) {
                if molecule.mol_type == MoleculeType::Label
                    && molecule.value & evochora_types::VALUE_MASK as i32 == hash
                {
                    return Some(self.env.shape().coord_of(*flat));
                }
            }
        }
        None
    }
}

/// Per-organism result of the parallel phase.
struct StepOutcome {
    writes: Vec<CellWrite>,
    births: Vec<BirthRequest>,
}

/// What one tick changed; input for the capture layer.
pub struct TickSummary {
    /// The tick that just completed.
    pub tick: i64,
    /// Flat indices of every cell whose word changed.
    pub changed_cells: BTreeSet<usize>,
    /// Organisms that executed an instruction this tick.
    pub stepped: Vec<OrganismId>,
    /// Organisms created this tick.
    pub born: Vec<OrganismId>,
    /// Organisms that died this tick.
    pub died: Vec<OrganismId>,
}

/// A full simulation: environment, population, worker pool, tick counter.
pub struct Simulation {
    env: Arc<Environment>,
    organisms: Vec<Organism>,
    /// organism id → flat indices of owned cells, maintained at commit
    ownership: BTreeMap<OrganismId, BTreeSet<usize>>,
    pool: WorkerPool,
    config: SimulationConfig,
    run_id: String,
    tick: i64,
    next_id: OrganismId,
    total_created: i64,
}

impl Simulation {
    /// Builds an empty world from validated configuration.
    pub fn new(config: SimulationConfig, run_id: &str) -> Simulation {
        let topology = match config.topology {
            TopologyKind::Bounded => Topology::Bounded,
            TopologyKind::Toroidal => Topology::Toroidal,
        };
        let shape = Shape::new(config.shape.clone(), topology);
        info!(
            "simulation {}: {:?} {} grid, parallelism {}",
            run_id,
            shape.dims(),
            topology,
            config.parallelism
        );
        Simulation {
            env: Arc::new(Environment::new(shape)),
            organisms: Vec::new(),
            ownership: BTreeMap::new(),
            pool: WorkerPool::new(config.parallelism),
            config,
            run_id: run_id.to_owned(),
            tick: 0,
            next_id: 1,
            total_created: 0,
        }
    }

    /// The shared environment.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Run identity used in storage paths and topic names.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The tick about to execute.
    pub fn current_tick(&self) -> i64 {
        self.tick
    }

    /// Organisms, dead ones included, in id order.
    pub fn organisms(&self) -> &[Organism] {
        &self.organisms
    }

    /// Total organisms ever created in this run.
    pub fn total_organisms_created(&self) -> i64 {
        self.total_created
    }

    /// Cells owned by `id` at the last commit.
    pub fn owned_cells(&self, id: OrganismId) -> Option<&BTreeSet<usize>> {
        self.ownership.get(&id)
    }

    /// Lays out a program's molecules at `origin` and spawns its organism.
    pub fn spawn_program(
        &mut self,
        program: &Program,
        origin: &[i32],
        initial_energy: i32,
    ) -> Result<OrganismId, EnvironmentError> {
        let id = self.allocate_id();
        for (offset, molecule) in &program.cells {
            let coord: Coord = origin.iter().zip(offset).map(|(o, d)| o + d).collect();
            let wrapped = self.env.wrap(&coord)?;
            self.env.set(&wrapped, *molecule, id)?;
            let flat = self.env.shape().flat_index(&wrapped);
            self.ownership.entry(id).or_default().insert(flat);
        }
        let birth_cell: Coord = origin
            .iter()
            .zip(&program.entry)
            .map(|(o, d)| o + d)
            .collect();
        let birth_cell = self.env.wrap(&birth_cell)?;
        let mut dv = vec![0; self.env.num_dims()];
        dv[0] = 1;
        let mut organism = Organism::create(
            id,
            0,
            self.tick,
            program.program_id.clone(),
            birth_cell,
            dv,
            initial_energy,
            self.config.max_energy,
        );
        organism.genome_hash =
            evochora_genome::genome_hash(&self.env, id, &organism.initial_position);
        debug!(
            "seeded organism {} from program {} at {:?}",
            id, program.program_id, organism.initial_position
        );
        self.organisms.push(organism);
        self.total_created += 1;
        Ok(id)
    }

    /// Adds a restored organism (checkpoint load).
    pub fn adopt(&mut self, organism: Organism) {
        self.next_id = self.next_id.max(organism.id + 1);
        self.total_created += 1;
        // rebuild the ownership entry from the grid
        let id = organism.id;
        let owned: BTreeSet<usize> = self
            .env
            .non_empty_cells()
            .filter(|(_, _, owner)| *owner == id)
            .map(|(flat, _, _)| flat)
            .collect();
        if !owned.is_empty() {
            self.ownership.insert(id, owned);
        }
        self.organisms.push(organism);
        self.organisms.sort_by_key(|o| o.id);
    }

    /// Executes one tick and reports what changed.
    pub fn tick(&mut self) -> TickSummary {
        let live: Vec<usize> = self
            .organisms
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_dead)
            .map(|(index, _)| index)
            .collect();

        let mut outcomes: Vec<Option<StepOutcome>> = Vec::new();
        outcomes.resize_with(live.len(), || None);

        {
            let organisms_ptr = SendPtr(self.organisms.as_mut_ptr());
            let outcomes_ptr = SendPtr(outcomes.as_mut_ptr());
            let live = &live;
            let env = &*self.env;
            let thermo = &self.config.thermodynamics;
            let stack_limit = self.config.stack_limit;
            let ownership = &self.ownership;

            self.pool
                .dispatch(live.len(), self.config.parallelism, move |from, to| {
                    // force capture of the whole `SendPtr` wrapper rather than
                    // its inner `*mut T` field (Rust 2021 disjoint closure
                    // captures would otherwise capture the raw pointer
                    // directly, which is not `Send`/`Sync`).
                    let organisms_ptr = &organisms_ptr;
                    let outcomes_ptr = &outcomes_ptr;
                    for slot in from..to {
                        let index = live[slot];
                        // SAFETY: `live` holds strictly increasing organism
                        // indices and dispatch hands out disjoint `[from, to)`
                        // slot ranges, so every organism and outcome slot is
                        // touched by exactly one worker per tick.
                        let organism = unsafe { &mut *organisms_ptr.0.add(index) };
                        let outcome = unsafe { &mut *outcomes_ptr.0.add(slot) };
                        let owned = ownership.get(&organism.id);
                        let mut ctx = StepCtx::new(env, thermo, stack_limit, owned);
                        isa::step(organism, &mut ctx);
                        *outcome = Some(StepOutcome {
                            writes: ctx.writes,
                            births: ctx.births,
                        });
                    }
                });
        }

        // serial commit in (organism_id, write_seq) order
        let mut changed_cells = BTreeSet::new();
        let mut born = Vec::new();
        for (slot, outcome) in outcomes.into_iter().enumerate() {
            let Some(outcome) = outcome else { continue };
            let writer = self.organisms[live[slot]].id;
            let mut writes = outcome.writes;
            writes.sort_by_key(|w| w.seq);
            for write in writes {
                self.apply_write(writer, &write, &mut changed_cells);
            }
            for birth in outcome.births {
                let parent = &self.organisms[live[slot]];
                let id = self.next_id;
                let child = Organism::create(
                    id,
                    parent.id,
                    self.tick,
                    parent.program_id.clone(),
                    birth.position.clone(),
                    birth.dv.clone(),
                    birth.energy,
                    self.config.max_energy,
                );
                self.allocate_id();
                self.total_created += 1;
                born.push(child.id);
                self.organisms.push(child);
            }
        }
        self.organisms.sort_by_key(|o| o.id);

        // post-step: deaths from energy exhaustion or KILL
        let mut died = Vec::new();
        for organism in &mut self.organisms {
            if organism.is_dead {
                continue;
            }
            if organism.er < 0 || organism.kill_requested {
                debug!(
                    "organism {} died at tick {} (energy {})",
                    organism.id, self.tick, organism.er
                );
                organism.die();
                died.push(organism.id);
            }
        }

        let stepped = live
            .iter()
            .map(|index| self.organisms[*index].id)
            .collect();
        let summary = TickSummary {
            tick: self.tick,
            changed_cells,
            stepped,
            born,
            died,
        };
        self.tick += 1;
        summary
    }

    /// Recomputes the genome hash of every live organism from its owned
    /// cells. Called by the capture layer before full enumerations so
    /// snapshots and the deltas that follow them agree.
    pub fn refresh_genome_hashes(&mut self) {
        let env = &self.env;
        let shape = env.shape();
        for organism in &mut self.organisms {
            if organism.is_dead {
                continue;
            }
            let Some(owned) = self.ownership.get(&organism.id) else {
                organism.genome_hash = evochora_genome::hash_cells(std::iter::empty());
                continue;
            };
            let cells = owned.iter().filter_map(|flat| {
                let (molecule, owner) = Molecule::decode(env.raw(*flat)).ok()?;
                (owner == organism.id
                    && !molecule.is_empty()
                    && evochora_genome::is_hashed_type(molecule.mol_type))
                .then(|| {
                    let rel = shape.relative(&organism.initial_position, &shape.coord_of(*flat));
                    (rel, molecule)
                })
            });
            organism.genome_hash = evochora_genome::hash_cells(cells);
        }
    }

    /// Shuts the worker pool down; further ticks are an error.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn apply_write(&mut self, writer: OrganismId, write: &CellWrite, changed: &mut BTreeSet<usize>) {
        let old_word = self.env.raw(write.flat);
        if old_word == write.word {
            return;
        }
        if let Ok((_, old_owner)) = Molecule::decode(old_word) {
            if old_owner != 0 && old_owner != writer {
                if let Some(owned) = self.ownership.get_mut(&old_owner) {
                    owned.remove(&write.flat);
                }
            }
        }
        self.ownership.entry(writer).or_default().insert(write.flat);
        self.env.set_raw(write.flat, write.word);
        changed.insert(write.flat);
    }

    fn allocate_id(&mut self) -> OrganismId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// A raw pointer that may cross into pool workers.
#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);

// SAFETY: the dispatch body guarantees disjoint element access; see the
// comment at the use site.
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}
