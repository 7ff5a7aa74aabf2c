use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::programs::types::{Program, ProgramStatus};

/// In-memory store of program versions keyed by program id and version.
#[derive(Default, Clone)]
pub struct ProgramCatalog {
    programs: HashMap<String, BTreeMap<u32, Arc<Program>>>,
}

impl ProgramCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a version. A published version can only be replaced
    /// by an identical definition.
    pub fn register(&mut self, program: Program) -> Result<()> {
        if program.id.trim().is_empty() {
            return Err(Error::Validation("program id must be non-empty".to_owned()));
        }
        let versions = self.programs.entry(program.id.clone()).or_default();
        if let Some(existing) = versions.get(&program.version) {
            if existing.status == ProgramStatus::Published && **existing != program {
                return Err(Error::Validation(format!(
                    "program '{}' v{} is published; register a new version instead",
                    program.id, program.version
                )));
            }
        }
        versions.insert(program.version, Arc::new(program));
        Ok(())
    }

    pub fn get(&self, program_id: &str, version: u32) -> Option<Arc<Program>> {
        self.programs.get(program_id)?.get(&version).cloned()
    }

    pub fn latest(&self, program_id: &str) -> Option<Arc<Program>> {
        self.programs
            .get(program_id)?
            .values()
            .next_back()
            .cloned()
    }

    pub fn latest_published(&self, program_id: &str) -> Option<Arc<Program>> {
        self.programs
            .get(program_id)?
            .values()
            .rev()
            .find(|program| program.status == ProgramStatus::Published)
            .cloned()
    }

    /// The requested version, or when none is given the newest published
    /// version, falling back to the newest executable one.
    pub fn resolve(&self, program_id: &str, version: Option<u32>) -> Result<Arc<Program>> {
        let found = match version {
            Some(version) => self.get(program_id, version),
            None => self.latest_published(program_id).or_else(|| {
                self.programs
                    .get(program_id)?
                    .values()
                    .rev()
                    .find(|program| program.is_executable())
                    .cloned()
            }),
        };
        found.ok_or_else(|| match version {
            Some(version) => Error::NotFound(format!("program '{program_id}' v{version}")),
            None => Error::NotFound(format!("program '{program_id}'")),
        })
    }

    pub fn publish(&mut self, program_id: &str, version: u32) -> Result<()> {
        let entry = self.entry_mut(program_id, version)?;
        Arc::make_mut(entry).publish()
    }

    pub fn archive(&mut self, program_id: &str, version: u32) -> Result<()> {
        let entry = self.entry_mut(program_id, version)?;
        Arc::make_mut(entry).archive();
        Ok(())
    }

    fn entry_mut(&mut self, program_id: &str, version: u32) -> Result<&mut Arc<Program>> {
        self.programs
            .get_mut(program_id)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| Error::NotFound(format!("program '{program_id}' v{version}")))
    }

    pub fn versions(&self, program_id: &str) -> Vec<u32> {
        self.programs
            .get(program_id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.programs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.programs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
