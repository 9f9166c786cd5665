use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use darkmap_core::{print_banner, seeds::load_seeds, ConfigFile, Crawler, CrawlSummary};
use darkmap_fetch::{TorClient, TorClientConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    if !quiet {
        print_banner();
    }

    match chosen_command.subcommand() {
        Some(("crawl", primary_command)) => handle_crawl(primary_command).await,
        Some(("cookie", primary_command)) => match primary_command.subcommand() {
            Some(("add", secondary_command)) => handle_cookie_add(secondary_command),
            Some(("remove", secondary_command)) => handle_cookie_remove(secondary_command),
            Some(("list", secondary_command)) => handle_cookie_list(secondary_command),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        None => {}
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

fn load_config_or_exit(args: &ArgMatches) -> ConfigFile {
    let config_path = args.get_one::<String>("config").unwrap();
    let expanded = shellexpand::tilde(config_path);
    match ConfigFile::load(expanded.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}

async fn handle_crawl(args: &ArgMatches) {
    tracing_subscriber::fmt::init();

    let config = load_config_or_exit(args);
    let seeds_path = args.get_one::<PathBuf>("seeds-file").unwrap();
    let seeds = match load_seeds(seeds_path) {
        Ok(seeds) => seeds,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };
    if seeds.is_empty() {
        eprintln!("{} seed file is empty", "error:".red().bold());
        std::process::exit(1);
    }

    let data = config.data().clone();
    let client = match TorClient::new(TorClientConfig {
        proxy: data.http_proxy.clone(),
        control_addr: format!("127.0.0.1:{}", data.control_port),
        control_password: data.control_password.clone(),
        ip_echo_url: data.ip_echo.clone(),
        ..Default::default()
    }) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };
    let config = Arc::new(Mutex::new(config));

    println!("\n🕸️  Crawling {} seed(s)", seeds.len());
    match &data.http_proxy {
        Some(proxy) => println!("Proxy: {proxy}"),
        None => println!("Proxy: {}", "none (direct connections)".yellow()),
    }
    println!("Max depth: {}  Max links: {}\n", data.max_depth, data.max_links);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Crawling...");

    let data_directory = PathBuf::from(shellexpand::tilde(&data.data_directory).as_ref());
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let multi_seed = seeds.len() > 1;

    let mut handles = Vec::new();
    for seed in seeds {
        // One output directory per seed; the host disambiguates when
        // several seeds share a project name.
        let dir_name = if multi_seed {
            format!("{}-{}-{}", data.project_name, host_of(&seed), date)
        } else {
            format!("{}-{}", data.project_name, date)
        };
        let project_dir = data_directory.join(dir_name);
        let client = Arc::clone(&client);
        let config = Arc::clone(&config);

        handles.push(tokio::spawn(async move {
            let crawler = Crawler::new(seed, project_dir, client, config).await?;
            crawler.run().await
        }));
    }

    let mut summaries: Vec<CrawlSummary> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => eprintln!("{} {e}", "crawl failed:".red().bold()),
            Err(e) => eprintln!("{} {e}", "crawl task panicked:".red().bold()),
        }
    }
    spinner.finish_and_clear();

    for summary in &summaries {
        print_summary(summary);
    }
}

fn host_of(seed: &str) -> String {
    Url::parse(seed)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "seed".to_string())
}

fn print_summary(summary: &CrawlSummary) {
    let counters = &summary.counters;
    println!("\n{} {}", "Seed:".bold(), summary.seed);
    println!("  Termination:      {}", summary.reason.to_string().cyan());
    println!(
        "  2xx: {}  3xx: {}  4xx: {}  5xx: {}",
        counters.n_2xx.to_string().green(),
        counters.n_3xx,
        counters.n_4xx.to_string().yellow(),
        counters.n_5xx.to_string().red()
    );
    println!("  Links discovered: {}", counters.nodes);
    println!("  Pages crawled:    {}", summary.crawled);
    println!("  Links skipped:    {}", counters.skipped);
    println!("  Requests sent:    {}", counters.requests);
    println!("  Coverage:         {:.1}%", summary.coverage());
}

fn handle_cookie_add(args: &ArgMatches) {
    let mut config = load_config_or_exit(args);
    let seed = args.get_one::<String>("seed").unwrap();
    let cookie = args.get_one::<String>("cookie").unwrap();

    match config.add_cookie(seed, cookie) {
        Ok(()) => println!("{} cookie added for {seed}", "ok:".green().bold()),
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}

fn handle_cookie_remove(args: &ArgMatches) {
    let mut config = load_config_or_exit(args);
    let seed = args.get_one::<String>("seed").unwrap();

    let result = match args.get_one::<String>("cookie") {
        Some(cookie) => config.remove_cookie(seed, cookie),
        None => config.remove_seed(seed),
    };
    match result {
        Ok(()) => println!("{} removed from {seed}", "ok:".green().bold()),
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}

fn handle_cookie_list(args: &ArgMatches) {
    let config = load_config_or_exit(args);
    let filter = args.get_one::<String>("seed");

    let entries: Vec<_> = config
        .data()
        .cookies
        .iter()
        .filter(|entry| filter.map(|seed| &entry.seed == seed).unwrap_or(true))
        .collect();

    if entries.is_empty() {
        println!("No cookies configured");
        return;
    }
    for entry in entries {
        println!("{}", entry.seed.bold());
        for cookie in &entry.cookies {
            println!("  {cookie}");
        }
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of_handles_garbage() {
        assert_eq!(host_of("http://market.onion/start"), "market.onion");
        assert_eq!(host_of("not a url"), "seed");
    }

    #[test]
    fn test_crawl_command_defaults() {
        let matches = command_argument_builder()
            .try_get_matches_from(["darkmap", "crawl", "-s", "seeds.txt"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "crawl");
        assert_eq!(
            sub.get_one::<PathBuf>("seeds-file").unwrap(),
            &PathBuf::from("seeds.txt")
        );
        assert_eq!(sub.get_one::<String>("config").unwrap(), "./darkmap.yml");
    }

    #[test]
    fn test_cookie_remove_tolerates_missing_cookie_arg() {
        let matches = command_argument_builder()
            .try_get_matches_from(["darkmap", "cookie", "remove", "-u", "http://x.onion"])
            .unwrap();
        let (_, cookie) = matches.subcommand().unwrap();
        let (name, sub) = cookie.subcommand().unwrap();
        assert_eq!(name, "remove");
        assert_eq!(sub.get_one::<String>("seed").unwrap(), "http://x.onion");
        assert!(sub.get_one::<String>("cookie").is_none());
    }
}
