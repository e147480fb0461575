use std::sync::Arc;

use anyhow::{Context, Result};

use super::RunCommandArgs;
use crate::core::config::SimulationConfig;
use crate::core::gateway::{
    CommandSolverGateway, CommandVisualizer, NoVisualization, VisualizationService,
};
use crate::core::montage::{CatalogQuery, ElectrodeNet, MontageCatalog};
use crate::core::scheduler::ParallelScheduler;
use crate::core::terminal::{self, print_info, print_step, print_warn};
use crate::logging;

pub async fn run_command(args: RunCommandArgs) -> Result<bool> {
    let config_path = args
        .config
        .clone()
        .context("run needs --config <simulation.toml>")?;
    let mut config = SimulationConfig::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    config.strict_catalog |= args.strict;
    config.validate()?;

    logging::init(&config.logs_dir());
    print_step(&format!("Subject {}", config.subject_id));

    let mut catalog = MontageCatalog::new();
    if let Some(path) = &args.catalog {
        catalog.load_named_file(path).await?;
    }
    if let Some(path) = &args.adhoc {
        catalog.load_adhoc_file(path).await?;
    }
    for path in &args.nets {
        catalog.add_net(ElectrodeNet::load(path).await?);
    }

    let query = if args.montages.is_empty() {
        if args.adhoc.is_none() {
            anyhow::bail!("nothing to run: pass --montages or --adhoc");
        }
        CatalogQuery::AllAdHoc
    } else {
        CatalogQuery::Names {
            names: args.montages.clone(),
            eeg_net: config.eeg_net.clone().unwrap_or_default(),
        }
    };
    let load = catalog.load(&query, config.strict_catalog)?;
    for rejected in &load.rejected {
        print_warn(&format!("Skipping {}: {}", rejected.name, rejected.error));
    }
    print_info(&format!(
        "{} montage(s) accepted, {} rejected",
        load.montages.len(),
        load.rejected.len()
    ));

    let solver = Arc::new(CommandSolverGateway::new(&config.tools));
    let visualizer: Arc<dyn VisualizationService> = match &config.tools.visualizer {
        Some(command) => Arc::new(CommandVisualizer::new(command.clone())),
        None => Arc::new(NoVisualization),
    };
    let workers = config.max_workers;
    let config = Arc::new(config);
    let scheduler = ParallelScheduler::new(solver, visualizer).with_catalog(Arc::new(catalog));

    let report = scheduler.run_load(load, config.clone(), workers).await?;
    let path = report.persist(&config.reports_dir()).await?;

    terminal::print_report(&report);
    print_info(&format!("Report written to {}", path.display()));
    Ok(report.all_succeeded())
}
