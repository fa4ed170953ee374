//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::crate_version;
use clap::Arg;
use clap::ArgAction;
use clap::Command;

pub fn cli() -> Command {
    Command::new("gator")
        .version(crate_version!())
        .about("Hierarchical shell-job supervisor with a websocket overlay tree")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .arg(Arg::new("config")
            .required(false)
            .long("config")
            .global(true)
            .value_name("FILE")
            .help("Path to the configuration file (default: XDG lookup of gator/config.toml)")
        )

        .subcommand(Command::new("run")
            .about("Run a spec tree to completion")
            .long_about(indoc::indoc!(r#"
                Run a spec tree to completion.

                The spec is YAML with custom tags:
                    !Job       ident, command, args, cwd, env, resources,
                               on_done, on_pass, on_fail
                    !JobGroup  ident, cwd, env, jobs
                    !JobArray  like !JobGroup plus repeats

                Resource tags are accepted in sequence and mapping form:
                    !Cores [4]            !Cores { count: 4 }
                    !Memory [2, GB]       !Memory { size: 2, unit: GB }
                    !License [name, 1]    !License { name: name, count: 1 }

                $NAME and ${NAME} references in string fields are expanded
                against the effective environment at job-launch time.

                The exit code is 0 when every job succeeded, 1 otherwise.
            "#))

            .arg(Arg::new("spec")
                .required(true)
                .index(1)
                .value_name("SPEC")
                .help("Path to the YAML spec file")
            )

            .arg(Arg::new("severity")
                .required(false)
                .short('s')
                .long("severity")
                .value_name("SEVERITY")
                .help("Minimum severity rendered to the console (DEBUG, INFO, WARNING, ERROR, CRITICAL)")
            )

            .arg(Arg::new("no_color")
                .required(false)
                .long("no-color")
                .action(ArgAction::SetTrue)
                .help("Disable colored console output")
            )
        )

        .subcommand(Command::new("wrapper")
            .hide(true)
            .about("Supervise one job process (spawned by a tier, not for interactive use)")

            .arg(Arg::new("ident")
                .required(false)
                .long("ident")
                .value_name("IDENT")
                .help("Identifier of this child (falls back to GATOR_IDENT)")
            )

            .arg(Arg::new("parent")
                .required(false)
                .long("parent")
                .value_name("URL")
                .help("Websocket URL of the parent (falls back to GATOR_PARENT)")
            )
        )

        .subcommand(Command::new("tier")
            .hide(true)
            .about("Supervise a job group (spawned by a parent tier, not for interactive use)")

            .arg(Arg::new("ident")
                .required(false)
                .long("ident")
                .value_name("IDENT")
                .help("Identifier of this child (falls back to GATOR_IDENT)")
            )

            .arg(Arg::new("parent")
                .required(false)
                .long("parent")
                .value_name("URL")
                .help("Websocket URL of the parent (falls back to GATOR_PARENT)")
            )
        )

        .subcommand(Command::new("stop")
            .about("Ask a running supervisor to stop gracefully")

            .arg(Arg::new("url")
                .required(true)
                .index(1)
                .value_name("URL")
                .help("Websocket URL of the supervisor")
            )

            .arg(Arg::new("timeout")
                .required(false)
                .long("timeout")
                .value_name("DURATION")
                .default_value("30s")
                .help("How long to wait for the stop acknowledgement (e.g. '30s', '2m')")
            )
        )

        .subcommand(Command::new("tree")
            .about("Show the live state of a running supervisor")

            .arg(Arg::new("url")
                .required(true)
                .index(1)
                .value_name("URL")
                .help("Websocket URL of the supervisor")
            )

            .arg(Arg::new("children")
                .required(false)
                .long("children")
                .action(ArgAction::SetTrue)
                .help("Show the direct children table instead of the recursive tree")
            )
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_internal_modes_parse() {
        let matches = cli()
            .try_get_matches_from(["gator", "wrapper", "--ident", "a", "--parent", "ws://h:1/"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "wrapper");
        assert_eq!(sub.get_one::<String>("ident").unwrap(), "a");
    }
}
