use std::io;
use std::process;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::CommandFactory;
use clap_complete::generate;
use tracing::{info, warn};

use monci::cli::{self, BootstrapArgs, CiArgs, Commands, ContainerActionArgs, GlobalArgs, ImageAction, ImageArgs, LintArgs, QuerySourceArgs, RemoveArgs, RunArgs, ShellArgs, UpdateArgs};
use monci::config::GlobalConfig;
use monci::container::{BindConfig, BindType, ContainerConfig, ContainerRuntime};
use monci::distro;
use monci::distro::Distro;
use monci::error::{self, MonciError};
use monci::executor::CommandExecutor;
use monci::image::{Image, ImagesProvider};
use monci::privilege::UserConfig;
use monci::session::Session;
use monci::source::{DistroSource, Source};

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    if let Commands::Completions(opts) = &args.command {
        let mut cmd = cli::Cli::command();
        generate(opts.shell, &mut cmd, "monci", &mut io::stdout());
        return Ok(());
    }

    monci::init_logging(args.global.log_level())?;

    let exit_code = match run(&args.global, &args.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            err.downcast_ref::<MonciError>().map(MonciError::exit_code).unwrap_or(error::exit_code::FAIL)
        }
    };
    process::exit(exit_code);
}

fn build_session(global: &GlobalArgs) -> Result<Session> {
    let config = match &global.config {
        Some(path) => GlobalConfig::load(path)?,
        None => GlobalConfig::load_default()?,
    };
    Session::new(config, global.imagedir.clone(), false)
}

fn run(global: &GlobalArgs, command: &Commands) -> Result<i32> {
    match command {
        Commands::Completions(_) => unreachable!("completions handled before logging setup"),
        Commands::Images(opts) => {
            let session = build_session(global)?;
            let mut names = session.images.list_images()?;
            names.sort();
            print_rows(&["image"], names.iter().map(|n| vec![n.clone()]), opts.csv);
            Ok(error::exit_code::SUCCESS)
        }
        Commands::Distros(opts) => {
            let mut names = distro::all_full_names();
            names.sort();
            print_rows(&["distro"], names.iter().map(|n| vec![n.clone()]), opts.csv);
            Ok(error::exit_code::SUCCESS)
        }
        Commands::Image(args) => run_image_action(global, args),
        Commands::Bootstrap(args) => run_bootstrap(global, args),
        Commands::Update(args) => run_update(global, args),
        Commands::Remove(args) => run_remove(global, args),
        Commands::Dedup => {
            let session = build_session(global)?;
            session.images.deduplicate()?;
            Ok(error::exit_code::SUCCESS)
        }
        Commands::Shell(args) => run_shell(global, args),
        Commands::Run(args) => run_run(global, args),
        Commands::Ci(args) => run_ci(global, args),
        Commands::Lint(args) => run_lint(global, args),
        Commands::QuerySource(args) => run_query_source(global, args),
    }
}

fn print_rows(header: &[&str], rows: impl Iterator<Item = Vec<String>>, csv: bool) {
    if csv {
        println!("{}", header.join(","));
        for row in rows {
            println!("{}", row.join(","));
        }
    } else {
        for row in rows {
            println!("{}", row.join("\t"));
        }
    }
}

fn run_image_action(global: &GlobalArgs, args: &ImageArgs) -> Result<i32> {
    let session = build_session(global)?;
    match &args.action {
        ImageAction::Distro { distro } => {
            info!("image {} would bootstrap from distro {}", args.name, distro);
            warn!("editing image configuration on disk is not yet wired up; run `monci image {} edit` instead", args.name);
        }
        ImageAction::Extends { parent } => {
            info!("image {} would extend {}", args.name, parent);
            warn!("editing image configuration on disk is not yet wired up; run `monci image {} edit` instead", args.name);
        }
        ImageAction::Setup { cmd } => {
            info!("image {} would append setup command: {}", args.name, cmd.join(" "));
        }
        ImageAction::Install { packages } => {
            info!("image {} would install packages: {}", args.name, packages.join(" "));
        }
        ImageAction::BuildDep { source } => {
            let image = session.images.image(&args.name)?;
            let local = Source::from_user_input(source)?;
            let distro_source = DistroSource::detect(local, image.distro().clone(), session.executor.as_ref())?;
            let deps = distro_source.lint_find_versions(false)?;
            for (key, value) in deps {
                println!("{key}: {value}");
            }
        }
        ImageAction::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            let path = image_config_path(&session, &args.name)?;
            let status = std::process::Command::new(editor).arg(path.as_str()).status().context("running $EDITOR")?;
            if !status.success() {
                bail!(MonciError::Fail(format!("editor exited with {status}")));
            }
        }
        ImageAction::Cat => {
            let path = image_config_path(&session, &args.name)?;
            let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            print!("{contents}");
        }
        ImageAction::Describe => {
            let image = session.images.image(&args.name)?;
            describe_image(&image);
        }
    }
    Ok(error::exit_code::SUCCESS)
}

fn image_config_path(session: &Session, name: &str) -> Result<Utf8PathBuf> {
    for dir in &session.config.imageconfdirs {
        for ext in ["yaml", "yml"] {
            let path = dir.join(format!("{name}.{ext}"));
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    bail!("no configuration file found for image {name:?} under the configured imageconfdirs")
}

fn describe_image(image: &Image) {
    match image {
        Image::Bootstrappable(b) => {
            println!("name: {}", b.name);
            println!("distro: {}", b.distro.full_name());
            if let Some(parent) = &b.parent {
                println!("extends: {parent}");
            }
            println!("packages: {}", b.config.packages.join(", "));
        }
        Image::Runnable(r) => {
            println!("name: {}", r.name);
            println!("distro: {}", r.distro.full_name());
            let config = r.config();
            println!("packages: {}", config.packages.join(", "));
            println!("forward_user: {}", config.forward_users.join(", "));
        }
    }
}

fn run_bootstrap(global: &GlobalArgs, args: &BootstrapArgs) -> Result<i32> {
    let session = build_session(global)?;
    let imagedir = session
        .config
        .imagedir
        .clone()
        .or_else(|| global.imagedir.clone())
        .context("bootstrapping requires an imagedir (-I/--imagedir or the config file)")?;
    std::fs::create_dir_all(&imagedir)?;

    let mut bootstrap_failed = false;
    for name in &args.images {
        let path = imagedir.join(name);
        if path.exists() {
            if !args.recreate {
                info!("image {name} already exists, skipping (pass --recreate to rebuild it)");
                continue;
            }
            std::fs::remove_dir_all(&path).with_context(|| format!("removing existing image at {path}"))?;
        }

        let image = session.images.image(name)?;
        let distro = image.distro().clone();
        info!("bootstrapping {name} from {}", distro.full_name());
        if let Err(err) = distro.bootstrap(session.executor.as_ref(), &path) {
            tracing::error!("bootstrap of {name} failed: {err:#}");
            bootstrap_failed = true;
            continue;
        }
    }

    if bootstrap_failed {
        bail!(MonciError::ContainerCannotStart("one or more images failed to bootstrap".to_string()));
    }
    Ok(error::exit_code::SUCCESS)
}

fn run_update(global: &GlobalArgs, args: &UpdateArgs) -> Result<i32> {
    let session = build_session(global)?;
    let names = if args.images.is_empty() { session.images.list_images()? } else { args.images.clone() };

    let mut update_failed = false;
    for name in names {
        let image = match session.images.image(&name) {
            Ok(image) => image,
            Err(err) => {
                warn!("skipping {name}: {err:#}");
                continue;
            }
        };
        let Some(runnable) = image.as_runnable() else {
            continue;
        };
        info!("updating {name}");
        let config = ContainerConfig { ephemeral: false, ..ContainerConfig::new() };
        let runtime = match session.start_container(runnable, config, true) {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!("update of {name} failed to start a container: {err:#}");
                update_failed = true;
                continue;
            }
        };
        let mut script = monci::script::Script::new().with_title("update pkgdb and upgrade system");
        runnable.distro.update_pkgdb_script(&mut script);
        runnable.distro.upgrade_system_script(&mut script);
        match runtime.run_script(&script, None) {
            Ok(result) if result.success() => {}
            Ok(result) => {
                tracing::error!("update of {name} exited with {}", result.returncode);
                update_failed = true;
            }
            Err(err) => {
                tracing::error!("update of {name} failed: {err:#}");
                update_failed = true;
            }
        }
    }

    if update_failed {
        return Ok(error::exit_code::UPDATE_FAILURE);
    }
    Ok(error::exit_code::SUCCESS)
}

fn run_remove(global: &GlobalArgs, args: &RemoveArgs) -> Result<i32> {
    let session = build_session(global)?;
    for name in &args.images {
        let image = session.images.image(name)?;
        match image.as_runnable() {
            Some(runnable) => match &runnable.backend {
                monci::image::BackendHandle::Path(path) => {
                    std::fs::remove_dir_all(path).with_context(|| format!("removing {path}"))?;
                }
                monci::image::BackendHandle::PodmanId(podman_image) => {
                    let spec = monci::executor::CommandSpec::new(
                        "podman",
                        vec![std::ffi::OsString::from("rmi"), std::ffi::OsString::from(podman_image.as_str())],
                    );
                    let result = session.executor.execute(&spec)?;
                    if !result.success() {
                        bail!(MonciError::subprocess("podman rmi", result.stdout_string()));
                    }
                }
            },
            None => info!("{name} has no runnable filesystem to remove"),
        }
        if args.purge {
            if let Ok(path) = image_config_path(&session, name) {
                std::fs::remove_file(&path).with_context(|| format!("removing {path}"))?;
            }
        }
    }
    Ok(error::exit_code::SUCCESS)
}

fn container_config_from_action(args: &ContainerActionArgs, _executor: &dyn monci::executor::CommandExecutor) -> Result<ContainerConfig> {
    let mut config = ContainerConfig::new();

    for entry in &args.binds {
        config.add_bind(BindConfig::parse_nspawn_entry(entry, BindType::ReadWrite)?);
    }
    for entry in &args.binds_ro {
        config.add_bind(BindConfig::parse_nspawn_entry(entry, BindType::ReadOnly)?);
    }
    for entry in &args.binds_volatile {
        config.add_bind(BindConfig::parse_nspawn_entry(entry, BindType::Volatile)?);
    }

    if let Some(workdir) = &args.workdir {
        config.configure_workdir(workdir, BindType::ReadWrite, camino::Utf8Path::new("/root"))?;
    } else if let Some(workdir) = &args.workdir_volatile {
        config.configure_workdir(workdir, BindType::Volatile, camino::Utf8Path::new("/root"))?;
    } else if args.clone.is_some() {
        bail!(MonciError::Fail("--clone is not yet wired up; clone the repository and pass it as a --workdir instead".to_string()));
    }

    if args.user {
        config.forward_user = Some(UserConfig::from_process());
    } else if args.root {
        config.forward_user = None;
    }

    config.ephemeral = !args.maintenance;
    Ok(config)
}

fn resolve_runnable(session: &Session, name: &str) -> Result<monci::image::RunnableImage> {
    let image = session.images.image(name)?;
    image.as_runnable().cloned().ok_or_else(|| anyhow::anyhow!("image {name:?} has not been bootstrapped yet"))
}

fn run_shell(global: &GlobalArgs, args: &ShellArgs) -> Result<i32> {
    let session = build_session(global)?;
    let runnable = resolve_runnable(&session, &args.container.image)?;
    let config = container_config_from_action(&args.container, session.executor.as_ref())?;
    let runtime = session.start_container(&runnable, config, args.container.maintenance)?;
    let result = runtime.run_shell(None)?;
    Ok(result.returncode)
}

fn run_run(global: &GlobalArgs, args: &RunArgs) -> Result<i32> {
    let session = build_session(global)?;
    let runnable = resolve_runnable(&session, &args.container.image)?;
    let config = container_config_from_action(&args.container, session.executor.as_ref())?;
    let runtime = session.start_container(&runnable, config, args.container.maintenance)?;
    let run_config = monci::container::RunConfig { interactive: true, ..Default::default() };
    let result = runtime.run(&args.cmd, Some(run_config))?;
    Ok(result.returncode)
}

fn run_ci(global: &GlobalArgs, args: &CiArgs) -> Result<i32> {
    use monci::build::{self, BuildConfig};

    let session = build_session(global)?;
    let runnable = resolve_runnable(&session, &args.image)?;

    let mut build_config = BuildConfig { quick: args.quick, source_only: args.source_only, ..BuildConfig::default() };
    if let Some(dir) = &args.artifacts_dir {
        build_config.artifacts_dir = Some(dir.clone());
    }
    for option in &args.options {
        match option.key.as_str() {
            "onSuccess" => build_config.on_success.push(option.value.clone()),
            "onFail" => build_config.on_fail.push(option.value.clone()),
            "onEnd" => build_config.on_end.push(option.value.clone()),
            "buildProfile" => build_config.build_profile = option.value.clone(),
            _ => warn!("unknown build option {:?}, ignoring", option.key),
        }
    }
    if args.shell {
        build_config.on_end.push("@shell".to_string());
    }
    if args.linger {
        build_config.on_end.push("@linger".to_string());
    }

    let local = Source::from_user_input(&args.source)?;
    let distro_source = DistroSource::detect(local, runnable.distro.clone(), session.executor.as_ref())?;
    let builder = build::builder_for(&distro_source)?;
    let (container_config, setup) = build::compose_container_config(&distro_source, runnable.distro.as_ref(), builder.as_ref(), &build_config)?;

    if build_config.source_only {
        return Ok(error::exit_code::SUCCESS);
    }

    let runtime = session.start_container(&runnable, container_config, false)?;
    let results = build::run_build(runtime.as_ref(), &distro_source, &build_config, &setup)?;

    let mut linger = false;
    build::run_post_build_hooks(runtime.as_ref(), &build_config, runnable.distro.full_name(), &args.image, &args.source, &results, &mut linger)?;
    if linger {
        std::mem::forget(runtime);
    }

    if !results.success {
        bail!(MonciError::Fail(format!("build of {} failed", args.source)));
    }
    Ok(error::exit_code::SUCCESS)
}

fn run_lint(global: &GlobalArgs, args: &LintArgs) -> Result<i32> {
    let session = build_session(global)?;
    let image = session.images.image(&args.image)?;
    let local = Source::from_user_input(&args.source)?;
    let distro_source = DistroSource::detect(local, image.distro().clone(), session.executor.as_ref())?;
    let report = monci::lint::lint_source(&distro_source, false)?;

    for warning in &report.warnings {
        warn!("{warning}");
    }
    for error in &report.errors {
        tracing::error!("{error}");
    }

    if report.has_errors() {
        Ok(error::exit_code::LINT_ERRORS)
    } else if report.has_warnings() {
        Ok(error::exit_code::FAIL)
    } else {
        Ok(error::exit_code::SUCCESS)
    }
}

fn run_query_source(global: &GlobalArgs, args: &QuerySourceArgs) -> Result<i32> {
    let session = build_session(global)?;
    let image = session.images.image(&args.image)?;
    let local = Source::from_user_input(&args.source)?;
    let distro_source = DistroSource::detect(local, image.distro().clone(), session.executor.as_ref())?;

    let versions = distro_source.lint_find_versions(false)?;
    let report = serde_json::json!({
        "style": distro_source.style.as_str(),
        "distro": distro_source.distro.full_name(),
        "versions": versions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(error::exit_code::SUCCESS)
}
