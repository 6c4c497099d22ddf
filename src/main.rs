use anyhow::{bail, Context, Result};
use clap::{App, Arg};
use log::info;
use std::time::Instant;

use strainquant::quant::readers::{PuffReader, SamReader};
use strainquant::quant::taxonomy::Rank;
use strainquant::quant::{QuantOpts, Quantifier};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let commands = App::new("strainquant")
        .version("0.1.0")
        .about("Strain and taxon abundance estimation from multi-mapping read alignments")
        .arg(Arg::new("mapperout")
            .short('m')
            .long("mapperout")
            .help("path to the mapper output file")
            .required(true)
            .takes_value(true)
            .display_order(1))
        .arg(Arg::new("output")
            .short('o')
            .long("output")
            .help("path to the output file to write results")
            .required(true)
            .takes_value(true)
            .display_order(2))
        .arg(Arg::new("taxtree")
            .short('t')
            .long("taxtree")
            .help("path to the taxonomy tree file")
            .takes_value(true)
            .required_unless_present("flat")
            .display_order(3))
        .arg(Arg::new("seq2taxa")
            .short('s')
            .long("seq2taxa")
            .help("path to the reference name to taxonomy id file")
            .takes_value(true)
            .required_unless_present("flat")
            .display_order(4))
        .arg(Arg::new("level")
            .short('l')
            .long("level")
            .help("rollup rank: species, genus, family, order, class, or phylum")
            .takes_value(true)
            .default_value("species")
            .display_order(5))
        .arg(Arg::new("maxIter")
            .long("maxIter")
            .help("maximum allowed iterations of EM")
            .takes_value(true)
            .default_value("1000"))
        .arg(Arg::new("eps")
            .long("eps")
            .help("EM convergence threshold on per-reference count change")
            .takes_value(true)
            .default_value("0.001"))
        .arg(Arg::new("minCnt")
            .short('c')
            .long("minCnt")
            .help("minimum estimated count for a reference to stay active")
            .takes_value(true)
            .default_value("0"))
        .arg(Arg::new("segmentSize")
            .long("segmentSize")
            .help("coverage bin width in bases")
            .takes_value(true)
            .default_value("200"))
        .arg(Arg::new("rangeFactorization")
            .long("rangeFactorization")
            .help("probability bucket parameter for equivalence classes, 0 disables")
            .takes_value(true)
            .default_value("4"))
        .arg(Arg::new("flat")
            .long("flat")
            .help("report flat per-reference abundances, no taxonomy involved")
            .takes_value(false))
        .arg(Arg::new("requireConcordance")
            .long("requireConcordance")
            .help("drop discordant hits of paired-end reads")
            .takes_value(false))
        .arg(Arg::new("onlyUnique")
            .long("onlyUnique")
            .help("use only uniquely mapped reads")
            .takes_value(false))
        .arg(Arg::new("onlyPerfect")
            .long("onlyPerfect")
            .help("use only hits whose score covers the whole read")
            .takes_value(false))
        .arg(Arg::new("sam")
            .long("sam")
            .help("treat the mapper output as SAM/BAM instead of the native dump format")
            .takes_value(false))
        .get_matches();

    let level_str = commands.value_of("level").unwrap();
    let level = match level_str {
        "species" => Rank::Species,
        "genus" => Rank::Genus,
        "family" => Rank::Family,
        "order" => Rank::Order,
        "class" => Rank::Class,
        "phylum" => Rank::Phylum,
        other => bail!("not a valid rollup rank: {}", other),
    };

    let opts = QuantOpts {
        level,
        max_iter: commands.value_of("maxIter").unwrap().parse().context("maxIter")?,
        eps: commands.value_of("eps").unwrap().parse().context("eps")?,
        min_cnt: commands.value_of("minCnt").unwrap().parse().context("minCnt")?,
        segment_size: commands.value_of("segmentSize").unwrap().parse().context("segmentSize")?,
        range_factorization: commands
            .value_of("rangeFactorization")
            .unwrap()
            .parse()
            .context("rangeFactorization")?,
        flat_abundance: commands.is_present("flat"),
        require_concordance: commands.is_present("requireConcordance"),
        only_unique: commands.is_present("onlyUnique"),
        only_perfect: commands.is_present("onlyPerfect"),
    };

    let mapper_output = commands.value_of("mapperout").unwrap();
    let output = commands.value_of("output").unwrap();

    let mut quantifier = if opts.flat_abundance {
        Quantifier::new(opts)
    } else {
        Quantifier::with_taxonomy(
            opts,
            commands.value_of("taxtree").unwrap(),
            commands.value_of("seq2taxa").unwrap(),
        )
        .context("loading taxonomy inputs")?
    };

    let start = Instant::now();
    if commands.is_present("sam") {
        let source = SamReader::from_path(mapper_output).context("opening alignment file")?;
        quantifier.load_mappings(source).context("loading mappings")?;
    } else {
        let source = PuffReader::from_path(mapper_output).context("opening mapper output")?;
        quantifier.load_mappings(source).context("loading mappings")?;
    }
    info!("loaded mappings in {:.2?}", start.elapsed());

    let start = Instant::now();
    let summary = quantifier.run_em();
    info!(
        "EM took {:.2?}, {} iterations, converged: {}",
        start.elapsed(),
        summary.iterations,
        summary.converged
    );

    quantifier.serialize_abundance(output).context("writing abundance table")?;
    quantifier
        .serialize_coverage(format!("{}.coverage", output))
        .context("writing coverage dump")?;
    Ok(())
}
