//! Configuração do kelpie carregada a partir de `kelpie.toml`.
//!
//! A struct [`KelpieConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `KELPIE_MPI_CALL` tem precedência sobre o arquivo.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detector::FailureKind;
use crate::error::KelpieError;
use crate::grazer::{GrazerSettings, RetryPolicy};
use crate::params::Params;
use crate::scheduler::{BatchTemplate, RetryConfig};
use crate::workflow::{StageSpec, WorkflowDefinition, preset};

/// Arquivo procurado no diretório atual quando `--config` não é informado.
pub const DEFAULT_CONFIG_FILE: &str = "kelpie.toml";

/// Configuração de nível superior.
#[derive(Debug, Clone, Deserialize)]
pub struct KelpieConfig {
    /// Retentativas permitidas por estágio.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Orçamento específico por tipo de falha (`walltime_exceeded = 10`).
    #[serde(default)]
    pub retry_overrides: BTreeMap<String, u32>,

    /// Intervalo entre consultas ao escalonador, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Nome do workflow predefinido.
    #[serde(default = "default_workflow")]
    pub workflow: String,

    /// Definição explícita de estágios; substitui o workflow predefinido.
    #[serde(default)]
    pub stages: Option<Vec<StageSpec>>,

    /// Parâmetros por estágio aplicados sobre os defaults do workflow predefinido.
    #[serde(default)]
    pub calculation_settings: BTreeMap<String, Params>,

    /// Arquivos copiados para todos os estágios (ex.: POTCAR).
    #[serde(default)]
    pub shared_inputs: Vec<PathBuf>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Comandos e script de submissão do escalonador.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub submit_cmd: String,
    pub status_cmd: String,
    pub accounting_cmd: String,
    pub cancel_cmd: String,
    /// Template próprio; sem ele, usa o template Slurm embutido.
    pub template: Option<PathBuf>,
    pub script_name: String,
    /// Arquivo de log escrito pelo escalonador dentro do diretório do estágio.
    pub log_file: String,
    pub mpi_call: String,
    pub modules: Vec<String>,
    /// Linhas `#SBATCH` extras, sem o prefixo.
    pub directives: Vec<String>,
    /// Valores para os placeholders do template.
    pub settings: BTreeMap<String, String>,
    /// Retentativas para falhas de infraestrutura do escalonador.
    pub submit_retry: RetryConfig,
}

// Valor padrão para o orçamento de retentativas: 3.
fn default_retry_budget() -> u32 {
    3
}

// Valor padrão para o intervalo de consulta: 60s.
fn default_poll_interval_secs() -> u64 {
    60
}

// Valor padrão para o workflow: relaxação seguida de cálculo estático.
fn default_workflow() -> String {
    "relaxation+static".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let settings = [("nodes", "1"), ("walltime", "24:00:00")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            submit_cmd: "sbatch".to_string(),
            status_cmd: "squeue".to_string(),
            accounting_cmd: "sacct".to_string(),
            cancel_cmd: "scancel".to_string(),
            template: None,
            script_name: "kelpie.q".to_string(),
            log_file: crate::calc_dir::DEFAULT_SCHEDULER_LOG.to_string(),
            mpi_call: "srun vasp_std".to_string(),
            modules: Vec::new(),
            directives: Vec::new(),
            settings,
            submit_retry: RetryConfig::default(),
        }
    }
}

impl Default for KelpieConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            retry_overrides: BTreeMap::new(),
            poll_interval_secs: default_poll_interval_secs(),
            workflow: default_workflow(),
            stages: None,
            calculation_settings: BTreeMap::new(),
            shared_inputs: Vec::new(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl KelpieConfig {
    /// Carrega a configuração de `path`, ou de `kelpie.toml` no diretório atual.
    /// Usa valores padrão se nenhum arquivo for informado nem encontrado.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        Ok(config.with_mpi_call_override(std::env::var("KELPIE_MPI_CALL").ok()))
    }

    /// Lê um arquivo `.json` ou `.toml` (qualquer outra extensão é tratada como TOML).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config: Result<Self, KelpieError> = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(KelpieError::from)
        } else {
            toml::from_str(&contents).map_err(KelpieError::from)
        };
        config.with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Variável de ambiente tem precedência sobre o arquivo para a chamada MPI.
    fn with_mpi_call_override(mut self, value: Option<String>) -> Self {
        if let Some(call) = value.filter(|call| !call.trim().is_empty()) {
            self.scheduler.mpi_call = call;
        }
        self
    }

    /// Política de retentativas; rejeita tipos de falha desconhecidos.
    pub fn retry_policy(&self) -> Result<RetryPolicy, KelpieError> {
        let mut policy = RetryPolicy::new(self.retry_budget);
        for (name, budget) in &self.retry_overrides {
            let kind: FailureKind = name.parse().map_err(KelpieError::Config)?;
            policy = policy.with_override(kind, *budget);
        }
        Ok(policy)
    }

    pub fn workflow_definition(&self) -> Result<WorkflowDefinition, KelpieError> {
        match &self.stages {
            Some(stages) => WorkflowDefinition::new(stages.clone()),
            None => preset(&self.workflow, &self.calculation_settings),
        }
    }

    /// Configurações do Grazer; o intervalo de consulta deve ser positivo.
    pub fn grazer_settings(&self) -> Result<GrazerSettings, KelpieError> {
        if self.poll_interval_secs == 0 {
            return Err(KelpieError::Config(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(GrazerSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            infra_retry: self.scheduler.submit_retry.clone(),
            template: BatchTemplate::from_config(&self.scheduler)?,
        })
    }
}
