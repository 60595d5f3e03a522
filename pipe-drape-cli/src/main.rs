use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use pipe_drape::config::{
    PipelineConfig, DEFAULT_EPSG, DEFAULT_IDENTIFIER, DEFAULT_MAX_ERROR, DEFAULT_VERTICAL_OFFSET,
};
use pipe_drape::fetch::download_tiles;
use pipe_drape::geojson::{output_path, read_network, write_network_3d};
use pipe_drape::ply::read_ply;
use pipe_drape::raster::discover_tiles;
use pipe_drape::{Assembler, TerrainSource};
use rayon::ThreadPoolBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// プロジェクトディレクトリを含むベースディレクトリ
    #[arg(value_name = "BASEDIR", env = "BASEDIR")]
    basedir: PathBuf,

    /// INPUT/TRACE 内のネットワークファイル名
    #[arg(short, long, value_name = "FILE", env = "TRACE_FILENAME")]
    trace: String,

    /// swisstopoからDEMタイルをダウンロード
    #[arg(long, env = "DOWNLOAD_TILE", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    download: bool,

    /// INPUT/MESH のPLYメッシュを使用（三角形分割を行わない）
    #[arg(long, env = "CUSTOM_MESH", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    custom_mesh: bool,

    /// 三角形分割の最大許容誤差（m）
    #[arg(long, default_value_t = DEFAULT_MAX_ERROR)]
    max_error: f64,

    /// 標高の鉛直オフセット（m）
    #[arg(long, default_value_t = DEFAULT_VERTICAL_OFFSET, allow_negative_numbers = true)]
    vertical_offset: f64,

    /// 分割された線を結合しない
    #[arg(long)]
    no_line_merge: bool,

    /// 区間を識別する属性名
    #[arg(long, default_value = DEFAULT_IDENTIFIER)]
    identifier: String,

    /// 結合したDEMをGeoTIFFとして保存
    #[arg(long)]
    write_merged_dem: bool,

    /// 並列処理スレッド数（デフォルト: CPUコア数）
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// ログレベル
    #[arg(long, env = "LOGLEVEL", default_value = "info")]
    log_level: Level,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_error: self.max_error,
            vertical_offset: self.vertical_offset,
            line_merge: !self.no_line_merge,
            identifier: self.identifier.clone(),
            epsg: DEFAULT_EPSG,
            write_merged_dem: self.write_merged_dem,
        }
    }
}

fn main() -> Result<()> {
    // CLI引数の解析
    let args = Args::parse();

    // ログの初期化
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    // 処理開始時間を記録
    let start_time = std::time::Instant::now();

    // スレッドプールの設定
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to build thread pool")?;
    }

    let config = args.pipeline_config();
    config.validate()?;

    if !args.basedir.is_dir() {
        error!("Invalid base directory: {:?}", args.basedir);
        anyhow::bail!("BASEDIR must be a directory");
    }

    let projects = collect_projects(&args.basedir)?;
    info!("Found {} project(s) in {:?}", projects.len(), args.basedir);

    // プロジェクトは順番に処理する
    let mut errors = Vec::new();
    for project in &projects {
        info!("Processing project: {:?}", project);
        match process_project(project, &args, &config) {
            Ok(output) => info!("Written 3D network: {:?}", output),
            Err(e) => errors.push(format!("{}: {:#}", project.display(), e)),
        }
    }

    if !errors.is_empty() {
        error!("Failed to process {} projects:", errors.len());
        for err in &errors {
            error!("  {}", err);
        }
        anyhow::bail!("{} projects failed to process", errors.len());
    }

    // 処理時間を表示
    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

fn collect_projects(basedir: &Path) -> Result<Vec<PathBuf>> {
    let mut projects = Vec::new();
    for entry in fs::read_dir(basedir).with_context(|| format!("Cannot read {:?}", basedir))? {
        let path = entry?.path();
        if path.is_dir() {
            projects.push(path);
        }
    }
    projects.sort();
    Ok(projects)
}

fn process_project(project: &Path, args: &Args, config: &PipelineConfig) -> Result<PathBuf> {
    let trace = project.join("INPUT").join("TRACE").join(&args.trace);
    let temp_dir = project.join("TEMP");
    fs::create_dir_all(&temp_dir)
        .with_context(|| format!("Cannot create working directory {:?}", temp_dir))?;

    let network = read_network(&trace, config.epsg)
        .with_context(|| format!("Failed to read network {:?}", trace))?;

    let terrain = if args.custom_mesh {
        // ユーザー指定のメッシュを使用
        let mesh_path = find_custom_mesh(&project.join("INPUT").join("MESH"))?;
        info!("Using custom mesh: {:?}", mesh_path);
        TerrainSource::Mesh(read_ply(&mesh_path)?)
    } else {
        if args.download {
            let bounds = network
                .footprint()
                .context("Network has no geometry to download tiles for")?;
            download_tiles(&bounds, &temp_dir)?;
        }
        let tiles = discover_tiles(&temp_dir)?;
        info!("Found {} DEM tile(s) in {:?}", tiles.len(), temp_dir);
        TerrainSource::Dem(tiles)
    };

    let collection = Assembler::new(config.clone()).assemble(&network, terrain)?;

    let output = output_path(&temp_dir, &trace);
    write_network_3d(&collection, &output)?;
    Ok(output)
}

fn find_custom_mesh(dir: &Path) -> Result<PathBuf> {
    let mut meshes: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Cannot read mesh directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("ply"))
        .collect();
    meshes.sort();
    meshes
        .into_iter()
        .next()
        .with_context(|| format!("No .ply mesh found in {:?}", dir))
}
