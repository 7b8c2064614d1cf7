mod args;
mod checks;
mod error;
mod manifest;
mod plot;
mod prompt;
mod record;
mod session;
mod solver;
mod stages;
mod xcorr;
mod xml;

use std::process;

use clap::{CommandFactory, Parser};

use args::Args;
use error::AlignError;
use manifest::load_records;
use plot::{NullVisualizer, PlotVisualizer, Visualizer};
use prompt::StdinPrompter;
use record::RecordSet;
use session::{print_totals, run_session, write_report, SessionOptions};
use solver::SolverOptions;

fn main() {
    match run() {
        Ok(()) => {}
        Err(AlignError::UserAborted) => {
            println!("[warn] {}", AlignError::UserAborted);
            process::exit(1);
        }
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(1);
        }
    }
}

fn run() -> Result<(), AlignError> {
    if std::env::args_os().len() == 1 {
        Args::command().print_help()?;
        println!();
        return Ok(());
    }

    let args = Args::parse();

    let available_cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } as usize;
    if args.cpu == 0 {
        return Err(AlignError::invalid_option("cpu", "must be at least 1"));
    }
    if args.cpu > available_cores {
        return Err(AlignError::invalid_option(
            "cpu",
            format!(
                "{} exceeds the number of available cores ({})",
                args.cpu, available_cores
            ),
        ));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.cpu)
        .build_global()
        .map_err(|e| AlignError::InvalidConfig(format!("thread pool setup failed: {}", e)))?;

    // All option validation happens before any record is read.
    let stages = args::build_stages(&args)?;
    let options = SessionOptions::from_pairs(
        &args.options,
        args::correlation_config(&args),
        SolverOptions::default(),
    )?;

    let mut checks = args::initial_checks(&args);
    let set = load_records(&args.manifest, &checks)?;

    banner(&args, &set, &options);

    let visualizer: Box<dyn Visualizer> = if args.no_plot {
        Box::new(NullVisualizer)
    } else {
        Box::new(PlotVisualizer::new(&args.plot_dir))
    };
    let mut input = StdinPrompter;

    let outcome = run_session(
        &mut checks,
        set,
        stages,
        options,
        &mut input,
        visualizer.as_ref(),
    )?;

    print_totals(&outcome);
    write_report(&args.report, &outcome)?;
    for file in &outcome.plot_files {
        println!("[plot] kept {}", file.display());
    }
    println!(
        "[info] session accepted after {} cycle(s)",
        outcome.audits.len()
    );
    Ok(())
}

fn banner(args: &Args, set: &RecordSet, options: &SessionOptions) {
    println!("Starting interactive alignment with the following configuration:");
    println!("--------------------------------------------------");
    println!("  manifest:   {}", args.manifest.display());
    println!("  records:    {}", set.len());
    println!("  dt:         {} s", set.dt);
    match set.common_span() {
        Some((lo, hi)) => println!("  span:       {:.3} .. {:.3} s (common)", lo, hi),
        None => println!("  span:       none (records do not overlap)"),
    }
    for record in &set.records {
        println!(
            "  record:     {} (start {:.3} s, prior {:+.3} s, {} samples)",
            record.name,
            record.start,
            record.prior_correction,
            record.data.len()
        );
    }
    println!(
        "  moveout:    {}",
        if args.no_moveout { "off" } else { "on" }
    );
    match &args.window {
        Some(window) => println!("  window:     {}", window),
        None => println!("  window:     full record"),
    }
    println!("  taper:      {}", args.taper);
    println!("  raise:      {}", args.raise);
    println!("  peak-count: {}", options.correlation.peak_count);
    println!("  min-space:  {} s", options.correlation.min_spacing);
    println!("  abs-coeff:  {}", options.correlation.use_absolute);
    match options.correlation.max_pair_gap {
        Some(gap) => println!("  pair-gap:   {}", gap),
        None => println!("  pair-gap:   unlimited"),
    }
    println!("  solver-it:  {}", options.solver.max_iterations);
    println!("  coeff-min:  {}", options.solver.min_coefficient);
    println!(
        "  checks:     structural {}, header {}",
        if args.skip_structural_checks {
            "skipped"
        } else {
            "on"
        },
        if args.skip_header_checks {
            "skipped"
        } else {
            "on"
        }
    );
    println!(
        "  plots:      {}",
        if args.no_plot {
            "disabled".to_string()
        } else {
            args.plot_dir.display().to_string()
        }
    );
    println!("  report:     {}", args.report.display());
    println!("  cpu:        {}", args.cpu);
    println!("--------------------------------------------------");
}
