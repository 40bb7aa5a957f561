// PaperDB CLI
// Thin command-line surface over the PaperDb facade: ingest files, ask
// questions, work the audit queue, and inspect stats.

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use paperdb::{
    init_logging_with_level, AuditFilter, AuditPriority, BatchFile, Clients, HttpEmbedder,
    HttpLlmClient, HttpParser, PaperDb, QueryRequest, QuerySource, RetryingEmbedder, Settings,
    TemplateBuilder, ValidatedDocumentId, ValidatedFieldId, ValidatedTemplateId,
    VerificationAction,
};

#[derive(ClapParser)]
#[command(
    name = "paperdb",
    about = "A document intelligence database for business paperwork",
    version
)]
struct Cli {
    /// Database directory
    #[arg(long, default_value = ".paperdb", env = "PAPERDB_DATA_DIR")]
    db: PathBuf,

    /// Use deterministic in-process service stubs instead of HTTP clients
    #[arg(long)]
    local: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one or more files
    Ingest {
        /// Files to ingest
        files: Vec<PathBuf>,
        /// Skip matching and use this template
        #[arg(long)]
        template: Option<String>,
    },
    /// Ask a natural-language question
    Query {
        /// The question
        text: String,
        /// Restrict to one template
        #[arg(long)]
        template: Option<String>,
    },
    /// Audit queue operations
    #[command(subcommand)]
    Audit(AuditCommand),
    /// Template operations
    #[command(subcommand)]
    Template(TemplateCommand),
    /// Re-extract a document from its cached parse
    Reprocess {
        /// Document id
        document: String,
    },
    /// Resume a suspended document with a chosen template
    Resume {
        /// Document id
        document: String,
        /// Template id
        template: String,
    },
    /// Show database statistics
    Stats,
}

#[derive(Subcommand)]
enum AuditCommand {
    /// List fields awaiting review
    List {
        /// Filter by priority (critical, high, medium)
        #[arg(long)]
        priority: Option<String>,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
    },
    /// Record a verification outcome
    Verify {
        /// Field id
        field: String,
        /// Outcome: correct, incorrect, or not-found
        action: String,
        /// Corrected value (required for incorrect)
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, env = "PAPERDB_REVIEWER")]
        reviewer: Option<String>,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// List templates
    List,
    /// Create a template from field specs like "invoice_total:number:required"
    Create {
        #[arg(long)]
        name: String,
        /// Template kind: invoice, receipt, contract, purchase_order, generic
        #[arg(long, default_value = "generic")]
        kind: String,
        /// Field specs: name:type[:required][:primary]
        #[arg(long = "field")]
        fields: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(cli.verbose, cli.quiet)?;

    let clients = build_clients(cli.local)?;
    let db_path = cli.db.to_string_lossy().to_string();
    std::fs::create_dir_all(&cli.db)
        .with_context(|| format!("Failed to create database directory {}", cli.db.display()))?;
    let db = PaperDb::open(&db_path, clients).await?;

    match cli.command {
        Command::Ingest { files, template } => ingest(&db, files, template).await,
        Command::Query { text, template } => query(&db, text, template).await,
        Command::Audit(command) => audit(&db, command).await,
        Command::Template(command) => template(&db, command).await,
        Command::Reprocess { document } => {
            let id = ValidatedDocumentId::parse(&document)?;
            let doc = db.reprocess_document(&id).await?;
            println!("{} -> {}", doc.id, doc.status);
            Ok(())
        }
        Command::Resume { document, template } => {
            let doc_id = ValidatedDocumentId::parse(&document)?;
            let template_id = ValidatedTemplateId::parse(&template)?;
            let doc = db.resume_with_template(&doc_id, &template_id).await?;
            println!("{} -> {}", doc.id, doc.status);
            Ok(())
        }
        Command::Stats => {
            let stats = db.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn build_clients(local: bool) -> Result<Clients> {
    if local {
        return Ok(Clients {
            parser: Arc::new(paperdb::testing::StubParser::new()),
            llm: None,
            embedder: None,
        });
    }

    let settings = Settings::default();
    let parser_url = std::env::var("PAPERDB_PARSER_URL")
        .context("PAPERDB_PARSER_URL is required (or pass --local)")?;
    let parser = Arc::new(HttpParser::new(
        parser_url,
        std::env::var("PAPERDB_PARSER_KEY").ok(),
    )?);

    let llm = match (
        std::env::var("PAPERDB_LLM_URL"),
        std::env::var("PAPERDB_LLM_KEY"),
    ) {
        (Ok(url), Ok(key)) => {
            let model = std::env::var("PAPERDB_LLM_MODEL")
                .unwrap_or_else(|_| "paper-large".to_string());
            Some(Arc::new(HttpLlmClient::new(url, key, model, &settings.llm)?)
                as Arc<dyn paperdb::LlmClient>)
        }
        _ => None,
    };

    let embedder = std::env::var("PAPERDB_EMBEDDER_URL").ok().map(|url| {
        HttpEmbedder::new(url, std::env::var("PAPERDB_EMBEDDER_KEY").ok(), &settings.embedder)
            .map(|inner| {
                Arc::new(RetryingEmbedder::from_settings(inner, &settings.embedder))
                    as Arc<dyn paperdb::Embedder>
            })
    });
    let embedder = match embedder {
        Some(result) => Some(result?),
        None => None,
    };

    Ok(Clients {
        parser,
        llm,
        embedder,
    })
}

async fn ingest(db: &PaperDb, files: Vec<PathBuf>, template: Option<String>) -> Result<()> {
    let requested_template_id = template
        .map(|raw| ValidatedTemplateId::parse(&raw))
        .transpose()?;

    let mut batch = Vec::with_capacity(files.len());
    for path in files {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        batch.push(BatchFile {
            filename,
            bytes,
            requested_template_id,
        });
    }

    let result = db.ingest_batch(batch).await;
    for success in &result.succeeded {
        println!("ok   {} {} ({})", success.document_id, success.filename, success.status);
    }
    for failure in &result.failed {
        println!(
            "fail {} [{:?}] {}",
            failure.filename, failure.error_code, failure.message
        );
    }
    println!(
        "matched: {} fast / {} llm, estimated cost {:.1}c",
        result.analytics.signature_matches,
        result.analytics.llm_matches,
        result.analytics.cost_estimate
    );
    Ok(())
}

async fn query(db: &PaperDb, text: String, template: Option<String>) -> Result<()> {
    let template_id = template
        .map(|raw| ValidatedTemplateId::parse(&raw))
        .transpose()?;
    let response = db
        .ask(QueryRequest {
            query: text,
            template_id,
            filters: Vec::new(),
            deadline_ms: None,
            query_source: QuerySource::AskAi,
        })
        .await?;

    println!("{}\n", response.answer);
    for source in &response.sources {
        println!("  source: {} ({:.2})", source.filename, source.score);
    }
    for aggregate in &response.aggregations {
        println!(
            "  {}: {:.2} over {} docs",
            aggregate.label, aggregate.value, aggregate.doc_count
        );
    }
    if response.audit_recommended {
        println!(
            "  note: {} low-confidence citation(s); review recommended",
            response.low_confidence_count
        );
    }
    for suggestion in &response.suggested_reformulations {
        println!("  try: {suggestion}");
    }
    println!(
        "  [{} confidence={:.2} llm={} fuzzy={} cache={} {}ms]",
        response.plan_diagnostics.intent,
        response.plan_diagnostics.confidence,
        response.plan_diagnostics.used_llm,
        response.plan_diagnostics.fuzzy_fallback_used,
        response.plan_diagnostics.cache_hit,
        response.timing_ms
    );
    Ok(())
}

async fn audit(db: &PaperDb, command: AuditCommand) -> Result<()> {
    match command {
        AuditCommand::List {
            priority,
            page,
            size,
        } => {
            let priority = priority
                .map(|raw| parse_priority(&raw))
                .transpose()?;
            let filter = AuditFilter {
                priority,
                ..AuditFilter::default()
            };
            let result = db.audit_list(&filter, page, size).await?;
            println!(
                "queue: {} total (critical {} / high {} / medium {})",
                result.priority_counts.total(),
                result.priority_counts.critical,
                result.priority_counts.high,
                result.priority_counts.medium
            );
            for item in &result.items {
                println!(
                    "  [{}] {} {} = {} (confidence {:.2}, {})",
                    item.field.audit_priority,
                    item.document_filename,
                    item.field.field_name,
                    item.field.current_value().unwrap_or_else(|| "<none>".into()),
                    item.field.confidence.get(),
                    item.field.validation_status
                );
            }
            Ok(())
        }
        AuditCommand::Verify {
            field,
            action,
            value,
            notes,
            reviewer,
        } => {
            let field_id = ValidatedFieldId::parse(&field)?;
            let action = parse_action(&action)?;
            let outcome = db
                .verify(&field_id, action, value, notes, reviewer, None)
                .await?;
            println!("verified {}", outcome.field.field_name);
            if let Some(next) = outcome.next_item {
                println!(
                    "next: {} {} ({})",
                    next.field.id, next.field.field_name, next.field.audit_priority
                );
            }
            Ok(())
        }
    }
}

async fn template(db: &PaperDb, command: TemplateCommand) -> Result<()> {
    match command {
        TemplateCommand::List => {
            for template in db.list_templates().await? {
                println!(
                    "{} {} (v{}, {} fields)",
                    template.id,
                    template.name,
                    template.signature_version,
                    template.fields.len()
                );
            }
            Ok(())
        }
        TemplateCommand::Create { name, kind, fields } => {
            let mut builder = TemplateBuilder::new(name)?.kind(parse_kind(&kind)?);
            for raw in &fields {
                builder = add_field_spec(builder, raw)?;
            }
            let template = db.create_template(builder.build()?).await?;
            println!("created {} {}", template.id, template.name);
            Ok(())
        }
    }
}

fn add_field_spec(builder: TemplateBuilder, raw: &str) -> Result<TemplateBuilder> {
    let parts: Vec<&str> = raw.split(':').collect();
    anyhow::ensure!(
        parts.len() >= 2,
        "Field spec must be name:type[:required][:primary], got '{raw}'"
    );
    let field_type = parse_field_type(parts[1])?;
    let required = parts.contains(&"required");
    let primary = parts.contains(&"primary");
    if required {
        let builder = builder.required_field(parts[0], field_type)?;
        Ok(builder)
    } else if primary {
        builder.primary_field(parts[0], field_type)
    } else {
        builder.field(parts[0], field_type)
    }
}

fn parse_field_type(raw: &str) -> Result<paperdb::FieldType> {
    use paperdb::FieldType::*;
    Ok(match raw {
        "text" => Text,
        "number" => Number,
        "date" => Date,
        "boolean" => Boolean,
        "array" => Array,
        "table" => Table,
        "array_of_objects" => ArrayOfObjects,
        other => anyhow::bail!("Unknown field type: {other}"),
    })
}

fn parse_kind(raw: &str) -> Result<paperdb::TemplateKind> {
    use paperdb::TemplateKind::*;
    Ok(match raw {
        "invoice" => Invoice,
        "receipt" => Receipt,
        "contract" => Contract,
        "purchase_order" => PurchaseOrder,
        "generic" => Generic,
        other => anyhow::bail!("Unknown template kind: {other}"),
    })
}

fn parse_priority(raw: &str) -> Result<AuditPriority> {
    Ok(match raw {
        "critical" => AuditPriority::Critical,
        "high" => AuditPriority::High,
        "medium" => AuditPriority::Medium,
        "low" => AuditPriority::Low,
        other => anyhow::bail!("Unknown priority: {other}"),
    })
}

fn parse_action(raw: &str) -> Result<VerificationAction> {
    Ok(match raw {
        "correct" => VerificationAction::Correct,
        "incorrect" => VerificationAction::Incorrect,
        "not-found" | "not_found" => VerificationAction::NotFound,
        other => anyhow::bail!("Unknown verification action: {other}"),
    })
}
