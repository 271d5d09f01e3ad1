//! # Counter Calculator Module
//!
//! ## Purpose
//! Computes counter values by aggregating stored financial figures. A pure
//! function of (counter, scope, year); has no awareness of any cache tier and
//! never touches the result store.
//!
//! ## Input/Output Specification
//! - **Input**: A counter key and the figures/councils in storage
//! - **Output**: The aggregate value plus a fingerprint of its inputs
//! - **Registry**: Built-in counter definitions, extendable via configuration
//!
//! ## Key Features
//! - Field-sum counters over one council or the whole population
//! - Per-capita counters dividing by resident population
//! - "Latest" scope resolved against the most recent stored year
//! - Input fingerprints (sha256) for change detection

use crate::config::CounterDefConfig;
use crate::errors::{CounterError, Result};
use crate::storage::FigureStore;
use crate::CounterKey;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// A counter definition: which figure fields it sums and how it is warmed
#[derive(Debug, Clone)]
pub struct CounterDef {
    /// Counter identifier (slug)
    pub id: String,
    /// Display name
    pub name: String,
    /// Figure fields summed to produce the counter
    pub fields: Vec<String>,
    /// Divide the sum by resident population
    pub per_capita: bool,
    /// Included in critical-tier warming passes
    pub critical: bool,
}

/// Registry of known counters
pub struct CounterRegistry {
    defs: HashMap<String, CounterDef>,
    order: Vec<String>,
}

impl CounterRegistry {
    /// The built-in counter set, mirroring the deployed site
    pub fn built_in() -> Self {
        let mut registry = Self {
            defs: HashMap::new(),
            order: Vec::new(),
        };

        let debt_fields = vec![
            "current-liabilities".to_string(),
            "long-term-liabilities".to_string(),
            "finance-leases".to_string(),
        ];

        registry.insert(CounterDef {
            id: "total-debt".to_string(),
            name: "Total Debt".to_string(),
            fields: debt_fields.clone(),
            per_capita: false,
            critical: true,
        });
        registry.insert(CounterDef {
            id: "total-debt-per-capita".to_string(),
            name: "Total Debt per Capita".to_string(),
            fields: debt_fields,
            per_capita: true,
            critical: true,
        });
        registry.insert(CounterDef {
            id: "current-liabilities".to_string(),
            name: "Current Liabilities".to_string(),
            fields: vec!["current-liabilities".to_string()],
            per_capita: false,
            critical: false,
        });
        registry.insert(CounterDef {
            id: "long-term-liabilities".to_string(),
            name: "Long-Term Liabilities".to_string(),
            fields: vec!["long-term-liabilities".to_string()],
            per_capita: false,
            critical: false,
        });
        registry.insert(CounterDef {
            id: "finance-leases".to_string(),
            name: "Finance Leases and PFI".to_string(),
            fields: vec!["finance-leases".to_string()],
            per_capita: false,
            critical: false,
        });
        registry.insert(CounterDef {
            id: "interest-paid".to_string(),
            name: "Interest Paid".to_string(),
            fields: vec!["interest-paid".to_string()],
            per_capita: false,
            critical: true,
        });

        registry
    }

    /// Built-in set plus configuration-supplied definitions.
    /// A configured counter with a built-in id replaces the built-in.
    pub fn with_config(extra: &[CounterDefConfig]) -> Self {
        let mut registry = Self::built_in();

        for def in extra {
            registry.insert(CounterDef {
                id: def.id.clone(),
                name: def.name.clone(),
                fields: def.fields.clone(),
                per_capita: def.per_capita,
                critical: def.critical,
            });
        }

        registry
    }

    fn insert(&mut self, def: CounterDef) {
        if !self.defs.contains_key(&def.id) {
            self.order.push(def.id.clone());
        }
        self.defs.insert(def.id.clone(), def);
    }

    /// Look up a definition
    pub fn get(&self, id: &str) -> Option<&CounterDef> {
        self.defs.get(id)
    }

    /// All definitions in registration order
    pub fn all(&self) -> impl Iterator<Item = &CounterDef> {
        self.order.iter().filter_map(|id| self.defs.get(id))
    }

    /// Definitions in the critical warming tier
    pub fn critical(&self) -> impl Iterator<Item = &CounterDef> {
        self.all().filter(|d| d.critical)
    }
}

/// The value and input fingerprint of one computation
#[derive(Debug, Clone, PartialEq)]
pub struct CounterComputation {
    pub value: Decimal,
    pub fingerprint: String,
}

/// Aggregate computation seam.
///
/// The orchestrator only sees this trait; tests substitute counting or
/// blocking implementations.
#[async_trait]
pub trait CounterCalculator: Send + Sync {
    async fn compute(&self, key: &CounterKey) -> Result<CounterComputation>;
}

/// Production calculator over the figure store
pub struct FigureCalculator {
    storage: Arc<FigureStore>,
    registry: Arc<CounterRegistry>,
}

impl FigureCalculator {
    pub fn new(storage: Arc<FigureStore>, registry: Arc<CounterRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Resolve `year = None` to the most recent year with stored figures
    async fn resolve_year(&self, key: &CounterKey) -> Result<Option<i32>> {
        match key.year {
            Some(year) => Ok(Some(year)),
            None => match &key.council {
                Some(council) => self.storage.latest_year_for_council(council).await,
                None => self.storage.latest_year().await,
            },
        }
    }

    /// Collect the input figures for one counter key as (figure, canonical line)
    async fn collect_inputs(
        &self,
        def: &CounterDef,
        key: &CounterKey,
        year: i32,
    ) -> Result<Vec<(Decimal, String)>> {
        let mut inputs = Vec::new();

        match &key.council {
            Some(council) => {
                for field in &def.fields {
                    if let Some(figure) = self.storage.get_figure(council, year, field).await? {
                        let line = format!(
                            "{}:{}:{}={}@{}",
                            figure.council, figure.year, figure.field, figure.value, figure.updated_at
                        );
                        inputs.push((figure.value, line));
                    }
                }
            }
            None => {
                for field in &def.fields {
                    for figure in self.storage.figures_for_field_year(field, year).await? {
                        let line = format!(
                            "{}:{}:{}={}@{}",
                            figure.council, figure.year, figure.field, figure.value, figure.updated_at
                        );
                        inputs.push((figure.value, line));
                    }
                }
            }
        }

        Ok(inputs)
    }

    /// Resident population for the key's scope.
    ///
    /// Site-wide per-capita counters divide by the combined population of
    /// councils that have one recorded; councils without one are excluded
    /// from the denominator.
    async fn population_for(&self, key: &CounterKey) -> Result<u64> {
        match &key.council {
            Some(council) => {
                let record = self.storage.get_council(council).await?.ok_or_else(|| {
                    CounterError::CouncilNotFound {
                        slug: council.clone(),
                    }
                })?;
                record.population.ok_or_else(|| CounterError::CalculationFailed {
                    counter: key.counter_id.clone(),
                    reason: format!("council '{}' has no recorded population", council),
                })
            }
            None => {
                let total: u64 = self
                    .storage
                    .list_councils()
                    .await?
                    .iter()
                    .filter_map(|c| c.population)
                    .sum();
                if total == 0 {
                    return Err(CounterError::CalculationFailed {
                        counter: key.counter_id.clone(),
                        reason: "no council has a recorded population".to_string(),
                    });
                }
                Ok(total)
            }
        }
    }

    fn fingerprint(mut lines: Vec<String>) -> String {
        lines.sort();
        let mut hasher = Sha256::new();
        for line in lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl CounterCalculator for FigureCalculator {
    async fn compute(&self, key: &CounterKey) -> Result<CounterComputation> {
        let def = self
            .registry
            .get(&key.counter_id)
            .ok_or_else(|| CounterError::UnknownCounter {
                counter_id: key.counter_id.clone(),
            })?
            .clone();

        let Some(year) = self.resolve_year(key).await? else {
            // Nothing stored yet: a zero aggregate over no inputs
            return Ok(CounterComputation {
                value: Decimal::ZERO,
                fingerprint: Self::fingerprint(Vec::new()),
            });
        };

        let inputs = self.collect_inputs(&def, key, year).await?;
        let mut value: Decimal = inputs.iter().map(|(v, _)| *v).sum();
        let mut lines: Vec<String> = inputs.into_iter().map(|(_, l)| l).collect();

        if def.per_capita {
            let population = self.population_for(key).await?;
            lines.push(format!("population={}", population));
            value = (value / Decimal::from(population)).round_dp(2);
        }

        tracing::debug!("Computed {} = {} ({} input figures)", key, value, lines.len());

        Ok(CounterComputation {
            value,
            fingerprint: Self::fingerprint(lines),
        })
    }
}
