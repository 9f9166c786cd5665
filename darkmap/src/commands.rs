use crate::CLAP_STYLING;
use clap::{arg, command};

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("darkmap")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("darkmap")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("crawl")
                .about(
                    "Crawl one or more hidden services through Tor, building a link graph \
                per seed.",
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("Path to the YAML configuration file")
                        .default_value("./darkmap.yml"),
                )
                .arg(
                    arg!(-s --"seeds-file" <PATH>)
                        .required(true)
                        .help("Path to a newline-delimited file of seed URLs")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
        .subcommand(
            command!("cookie")
                .about("Manage the per-seed session cookie sets in the configuration")
                .subcommand(
                    command!("add")
                        .about("Adds a session cookie for a seed")
                        .arg(
                            arg!(-c --"config" <PATH>)
                                .required(false)
                                .help("Path to the YAML configuration file")
                                .default_value("./darkmap.yml"),
                        )
                        .arg(
                            arg!(-u --"seed" <URL>)
                                .required(true)
                                .help("The seed URL the cookie belongs to"),
                        )
                        .arg(
                            arg!(-k --"cookie" <COOKIE>)
                                .required(true)
                                .help("The session cookie string, e.g. 'session=abc123'"),
                        ),
                )
                .subcommand(
                    command!("remove")
                        .about("Removes one cookie, or the seed's whole cookie set")
                        .arg(
                            arg!(-c --"config" <PATH>)
                                .required(false)
                                .help("Path to the YAML configuration file")
                                .default_value("./darkmap.yml"),
                        )
                        .arg(
                            arg!(-u --"seed" <URL>)
                                .required(true)
                                .help("The seed URL to remove from"),
                        )
                        .arg(
                            arg!(-k --"cookie" <COOKIE>)
                                .required(false)
                                .help("The cookie to remove; omit to drop the whole seed entry"),
                        ),
                )
                .subcommand(
                    command!("list")
                        .about("Lists the configured cookies")
                        .arg(
                            arg!(-c --"config" <PATH>)
                                .required(false)
                                .help("Path to the YAML configuration file")
                                .default_value("./darkmap.yml"),
                        )
                        .arg(
                            arg!(-u --"seed" <URL>)
                                .required(false)
                                .help("Only list cookies for this seed"),
                        ),
                ),
        )
}
