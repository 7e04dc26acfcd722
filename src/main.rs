use std::fs::{read_to_string, write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use log::{info, LevelFilter};

mod audit;
mod bbox;
mod changes;
mod conflator;
mod dataset;
mod geocoder;
mod merge;
mod osm_xml;
mod output;
mod overpass;
mod point;
mod profile;

use conflator::Conflator;
use geocoder::{Geocoder, PlaceTable, RegionFilter};
use overpass::Overpass;
use profile::Profile;

/// Conflates a point dataset with OpenStreetMap data and produces an
/// upload-ready changeset.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON profile describing the dataset and what to query from OSM
    profile: PathBuf,
    /// Dataset file; without it the profile's download_url is fetched
    #[arg(short = 'i', long = "source")]
    source: Option<PathBuf>,
    /// Output file for the changeset, stdout if omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Produce an osmChange file instead of JOSM XML
    #[arg(long)]
    osc: bool,
    /// Use this OSM XML file instead of querying Overpass; it is created
    /// from the downloaded data when missing
    #[arg(long)]
    osm: Option<PathBuf>,
    /// Write changes as GeoJSON for visualization
    #[arg(short, long)]
    changes: Option<PathBuf>,
    /// Write a CSV table of matched records
    #[arg(short, long)]
    matches: Option<PathBuf>,
    /// JSON file with reviewer directives
    #[arg(short, long)]
    audit: Option<PathBuf>,
    /// Overpass server base URL, or "alt" for the mirror
    #[arg(long)]
    overpass: Option<String>,
    /// Tab-separated places file for region geocoding
    #[arg(long)]
    places: Option<PathBuf>,
    /// Comma-separated regions to keep; prefix with "-" to drop instead
    #[arg(short, long)]
    regions: Option<String>,
    /// Display info messages, use -vv for debugging
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .init();

    let profile = Profile::load(&cli.profile)
        .with_context(|| format!("failed to load profile {}", cli.profile.display()))?;

    let mut dataset = dataset::read_dataset(&profile, cli.source.as_deref())?;
    dataset::transform_dataset(&profile, &mut dataset);
    dataset::add_categories(&profile, &mut dataset);
    dataset::check_for_duplicates(&profile, &mut dataset)?;

    let geocoder = Geocoder {
        resolver: match &cli.places {
            Some(path) => Some(Box::new(PlaceTable::read(path)?)),
            None => None,
        },
        filter: cli.regions.as_deref().map(RegionFilter::parse),
    };
    geocoder::add_regions(&mut dataset, &geocoder);

    let audit = match &cli.audit {
        Some(path) => audit::read_audit(path)?,
        None => audit::Audit::new(),
    };

    let mut conflator = Conflator::new(&profile, dataset, audit);
    conflator.geocoder = geocoder;

    match &cli.osm {
        Some(path) if path.exists() => {
            let xml = read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            conflator.osmdata = osm_xml::parse_osm_xml(&profile, &xml)?;
        }
        cached => {
            let mut overpass = Overpass::default();
            if let Some(server) = &cli.overpass {
                overpass.set_server(server);
            }
            let records: Vec<_> = conflator.dataset.values().cloned().collect();
            let bboxes = Overpass::calc_boxes(&profile, &records);
            let xml = overpass.download(&profile, &bboxes)?;
            conflator.osmdata = osm_xml::parse_osm_xml(&profile, &xml)?;
            if let Some(path) = cached {
                if !conflator.osmdata.is_empty() {
                    write(path, output::backup_osm(&conflator.osmdata)?)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
            }
        }
    }
    info!("got {} objects from OSM", conflator.osmdata.len());

    conflator.conflate();

    let source = profile.source.clone().unwrap_or_default();
    let diff = output::to_osc(&conflator.matched, &source, !cli.osc)?;
    match &cli.output {
        Some(path) => {
            write(path, diff).with_context(|| format!("failed to write {}", path.display()))?
        }
        None => print!("{diff}"),
    }
    if let Some(path) = &cli.changes {
        write(path, output::changes_geojson(&conflator.changes)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    if let Some(path) = &cli.matches {
        write(path, output::matches_csv(&conflator.matches)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
