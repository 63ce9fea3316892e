//! Interface de linha de comando do kelpie baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (breed, graze, status)
//! e flags globais (--config, --retry-budget, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Diretório de execução padrão, relativo ao diretório atual.
pub const DEFAULT_RUN_LOCATION: &str = "kelpie_run";

/// kelpie: supervisão de cálculos VASP em clusters com Slurm.
#[derive(Debug, Parser)]
#[command(name = "kelpie", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (.toml ou .json). Padrão: ./kelpie.toml.
    #[arg(long, global = true, env = "KELPIE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Retentativas por estágio; substitui o valor da configuração.
    #[arg(long, global = true)]
    pub retry_budget: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prepara um workflow a partir de uma estrutura e o executa.
    Breed {
        /// Estrutura inicial (POSCAR).
        #[arg(long, short)]
        input: PathBuf,

        /// Diretório da execução.
        #[arg(long, short, default_value = DEFAULT_RUN_LOCATION)]
        run: PathBuf,

        /// Apenas submete o primeiro estágio e retorna.
        #[arg(long, conflicts_with = "wait")]
        submit: bool,

        /// Supervisiona todos os estágios até o fim (padrão).
        #[arg(long)]
        wait: bool,
    },

    /// Retoma a supervisão de uma execução existente.
    Graze {
        /// Diretório da execução.
        #[arg(long, short, default_value = DEFAULT_RUN_LOCATION)]
        run: PathBuf,

        /// Apaga os diretórios dos estágios e recomeça.
        #[arg(long)]
        from_scratch: bool,
    },

    /// Mostra o estado de cada estágio de uma execução.
    Status {
        /// Diretório da execução.
        #[arg(long, short, default_value = DEFAULT_RUN_LOCATION)]
        run: PathBuf,
    },
}
