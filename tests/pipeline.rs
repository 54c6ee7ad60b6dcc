//! End-to-end pipeline behaviour with an in-process extractor, classifier
//! and remote model. No pdfium, tesseract or network involved.

use async_trait::async_trait;
use edgequake_pdf2deck::pipeline::classify::{ImageClassifier, ImageKind};
use edgequake_pdf2deck::pipeline::extract::{Page, PageExtractor};
use edgequake_pdf2deck::prompts::{SKIP_CONCLUSION_INSTRUCTION, SKIP_INTRO_INSTRUCTION};
use edgequake_pdf2deck::{
    EngineUsed, ErrorKind, Pdf2DeckError, Pipeline, PipelineConfig, PipelineProgressCallback,
    PipelineState, RemoteError, RemoteModel, RemoteReply, RemoteRequest, Slide,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Returns a fixed page list and counts calls.
struct FakeExtractor {
    pages: Vec<Page>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    /// `rendered` lists the 0-based pages that have no text layer.
    fn new(total: usize, rendered: &[usize]) -> Arc<Self> {
        let pages = (0..total)
            .map(|i| {
                if rendered.contains(&i) {
                    Page::rendered(i, vec![0x89, b'P', b'N', b'G', i as u8])
                } else {
                    Page::digital(i, format!("Digital text of page {}", i + 1))
                }
            })
            .collect();
        Arc::new(Self {
            pages,
            calls: AtomicUsize::new(0),
        })
    }
}

impl PageExtractor for FakeExtractor {
    fn extract(&self, _pdf: &[u8]) -> Result<Vec<Page>, Pdf2DeckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages.clone())
    }
}

/// Always answers `kind`; counts calls.
struct CountingClassifier {
    kind: ImageKind,
    calls: AtomicUsize,
}

impl CountingClassifier {
    fn handwritten() -> Arc<Self> {
        Arc::new(Self {
            kind: ImageKind::Handwritten,
            calls: AtomicUsize::new(0),
        })
    }
}

impl ImageClassifier for CountingClassifier {
    fn classify(&self, _png: &[u8]) -> ImageKind {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Vision,
    Clean,
    Structure,
    Mutate,
}

fn call_kind(request: &RemoteRequest) -> Call {
    if request.image.is_some() {
        Call::Vision
    } else if request.prompt.contains("CURRENT_JSON") {
        Call::Mutate
    } else if request.prompt.contains("CLEANED_TEXT") {
        Call::Structure
    } else {
        Call::Clean
    }
}

const BLUEPRINT: &str = r#"[{"title":"Cells","content":["Membrane","Nucleus"]},{"title":"Energy","content":["ATP"]}]"#;

/// Answers by call kind. Scripted replies are consumed first, then the
/// default for that kind is used.
struct ScriptedModel {
    script: Mutex<Vec<(Call, VecDeque<Result<String, RemoteError>>)>>,
    log: Mutex<Vec<(Call, RemoteRequest, Instant)>>,
}

impl ScriptedModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn script(
        self: &Arc<Self>,
        call: Call,
        replies: Vec<Result<String, RemoteError>>,
    ) -> Arc<Self> {
        self.script
            .lock()
            .unwrap()
            .push((call, replies.into_iter().collect()));
        Arc::clone(self)
    }

    fn requests(&self, call: Call) -> Vec<RemoteRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == call)
            .map(|(_, r, _)| r.clone())
            .collect()
    }

    fn times(&self, call: Call) -> Vec<Instant> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == call)
            .map(|(_, _, t)| *t)
            .collect()
    }

    fn default_reply(call: Call, request: &RemoteRequest) -> String {
        match call {
            Call::Vision => "Handwritten notes about mitochondria".to_string(),
            Call::Clean => {
                let part = request
                    .prompt
                    .split("This is PART ")
                    .nth(1)
                    .and_then(|s| s.split_whitespace().next())
                    .unwrap_or("?");
                format!("```markdown\n# Cleaned part {part}\n\nBody text\n```")
            }
            Call::Structure => BLUEPRINT.to_string(),
            Call::Mutate => r#"[{"title":"Only","content":[]}]"#.to_string(),
        }
    }
}

#[async_trait]
impl RemoteModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteError> {
        let call = call_kind(&request);
        self.log
            .lock()
            .unwrap()
            .push((call, request.clone(), Instant::now()));

        let scripted = self
            .script
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(c, _)| *c == call)
            .and_then(|(_, q)| q.pop_front());

        let text = match scripted {
            Some(reply) => reply?,
            None => Self::default_reply(call, &request),
        };
        Ok(RemoteReply {
            text,
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

#[derive(Default)]
struct StateRecorder {
    states: Mutex<Vec<PipelineState>>,
    page_errors: AtomicUsize,
    chunk_errors: AtomicUsize,
}

impl PipelineProgressCallback for StateRecorder {
    fn on_state_change(&self, state: PipelineState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_page_error(&self, _page_num: usize, _error: &str) {
        self.page_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_chunk_error(&self, _chunk_index: usize, _total_chunks: usize, _error: &str) {
        self.chunk_errors.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(recorder: Option<Arc<StateRecorder>>) -> PipelineConfig {
    let mut builder = PipelineConfig::builder()
        .chunk_size(5)
        .inter_chunk_delay_ms(0)
        .ocr_interval_ms(0)
        .retry_backoff_ms(1000)
        .local_ocr(None);
    if let Some(r) = recorder {
        builder = builder.progress_callback(r);
    }
    builder.build().unwrap()
}

fn pipeline(
    config: PipelineConfig,
    extractor: Arc<FakeExtractor>,
    classifier: Arc<CountingClassifier>,
    model: Arc<ScriptedModel>,
) -> Pipeline {
    Pipeline::new(config)
        .with_extractor(extractor)
        .with_classifier(classifier)
        .with_local_ocr(None)
        .with_client(model)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn twelve_page_mixed_document() {
    let recorder = Arc::new(StateRecorder::default());
    let extractor = FakeExtractor::new(12, &[2, 7]);
    let classifier = CountingClassifier::handwritten();
    let model = ScriptedModel::new();

    let mut p = pipeline(
        config(Some(recorder.clone())),
        extractor.clone(),
        classifier.clone(),
        model.clone(),
    );
    let session = tokio_test::assert_ok!(p.run(b"%PDF-1.7").await);

    assert_eq!(p.state(), Some(PipelineState::Ready));
    assert_eq!(session.state(), PipelineState::Ready);
    assert_eq!(
        *recorder.states.lock().unwrap(),
        vec![
            PipelineState::Extracting,
            PipelineState::ClassifyingOcr,
            PipelineState::Cleaning,
            PipelineState::Structuring,
            PipelineState::Ready,
        ]
    );

    // Only the two rendered pages are classified and sent for vision OCR.
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    assert_eq!(model.requests(Call::Vision).len(), 2);
    assert!(model
        .requests(Call::Vision)
        .iter()
        .all(|r| r.temperature == 0.0));

    assert_eq!(session.pages.len(), 12);
    for (i, page) in session.pages.iter().enumerate() {
        assert_eq!(page.page_index, i);
        let expected = if i == 2 || i == 7 {
            EngineUsed::OcrRemote
        } else {
            EngineUsed::Digital
        };
        assert_eq!(page.engine_used, expected, "page {}", i + 1);
    }
    assert_eq!(session.stats.digital_pages, 10);
    assert_eq!(session.stats.remote_ocr_pages, 2);

    // Chunks of 5, 5 and 2 pages, cleaned in order with position-aware prompts.
    let cleans = model.requests(Call::Clean);
    assert_eq!(cleans.len(), 3);
    assert!(cleans[0].prompt.contains("PART 1 of 3"));
    assert!(!cleans[0].prompt.contains(SKIP_INTRO_INSTRUCTION));
    assert!(cleans[0].prompt.contains(SKIP_CONCLUSION_INSTRUCTION));
    assert!(cleans[1].prompt.contains(SKIP_INTRO_INSTRUCTION));
    assert!(cleans[1].prompt.contains(SKIP_CONCLUSION_INSTRUCTION));
    assert!(cleans[2].prompt.contains(SKIP_INTRO_INSTRUCTION));
    assert!(!cleans[2].prompt.contains(SKIP_CONCLUSION_INSTRUCTION));
    assert!(cleans[0].prompt.contains("mitochondria"), "OCR text of page 3 is in part 1");
    assert!(cleans[2].prompt.contains("Digital text of page 12"));

    let sizes: Vec<usize> = (0..3)
        .map(|i| {
            cleans[i]
                .prompt
                .matches("Digital text of page")
                .count()
                + cleans[i].prompt.matches("mitochondria").count()
        })
        .collect();
    assert_eq!(sizes, vec![5, 5, 2]);

    // Fences from the model are stripped; parts are stitched in order.
    assert!(!session.cleaned_markdown.contains("```"));
    let p1 = session.cleaned_markdown.find("# Cleaned part 1").unwrap();
    let p3 = session.cleaned_markdown.find("# Cleaned part 3").unwrap();
    assert!(p1 < p3);

    let bp = session.blueprint().expect("blueprint");
    assert_eq!(bp.len(), 2);
    assert_eq!(bp.slides[0], Slide::new("Cells", vec!["Membrane".into(), "Nucleus".into()]));

    // 2 vision + 3 clean + 1 structure calls, 10 in / 5 out each.
    assert_eq!(session.stats.total_input_tokens, 60);
    assert_eq!(session.stats.total_output_tokens, 30);
}

#[tokio::test]
async fn digital_only_document_skips_ocr_state() {
    let recorder = Arc::new(StateRecorder::default());
    let classifier = CountingClassifier::handwritten();
    let model = ScriptedModel::new();

    let mut p = pipeline(
        config(Some(recorder.clone())),
        FakeExtractor::new(3, &[]),
        classifier.clone(),
        model.clone(),
    );
    let session = p.run(b"%PDF").await.unwrap();

    assert!(!recorder
        .states
        .lock()
        .unwrap()
        .contains(&PipelineState::ClassifyingOcr));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    assert!(model.requests(Call::Vision).is_empty());
    assert_eq!(session.chunks.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_chunk_is_retried_with_doubling_delay() {
    let model = ScriptedModel::new().script(
        Call::Clean,
        vec![
            Err(RemoteError::new(ErrorKind::RateLimited, "429 Too Many Requests")),
            Err(RemoteError::new(ErrorKind::RateLimited, "429 Too Many Requests")),
            Ok("## Third attempt\n\nCleaned on the third try.".into()),
        ],
    );

    let mut p = pipeline(
        config(None),
        FakeExtractor::new(2, &[]),
        CountingClassifier::handwritten(),
        model.clone(),
    );
    let session = p.run(b"%PDF").await.unwrap();

    let times = model.times(Call::Clean);
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(1000) && first_gap < Duration::from_millis(1500));
    assert!(second_gap >= Duration::from_millis(2000) && second_gap < Duration::from_millis(2500));

    assert_eq!(session.chunks[0].attempts, 3);
    assert!(session.chunks[0].error.is_none());
    assert_eq!(
        session.chunks[0].markdown_text,
        "## Third attempt\n\nCleaned on the third try."
    );
    assert_eq!(session.cleaned_markdown, session.chunks[0].markdown_text);
}

#[tokio::test(start_paused = true)]
async fn failed_page_becomes_marker_and_run_continues() {
    let recorder = Arc::new(StateRecorder::default());
    let model = ScriptedModel::new().script(
        Call::Vision,
        vec![Err(RemoteError::permanent("400 invalid image"))],
    );

    let mut p = pipeline(
        config(Some(recorder.clone())),
        FakeExtractor::new(3, &[1]),
        CountingClassifier::handwritten(),
        model.clone(),
    );
    let session = p.run(b"%PDF").await.unwrap();

    assert_eq!(model.requests(Call::Vision).len(), 1, "permanent errors are not retried");
    assert!(session.pages[1].error.is_some());
    assert!(session.pages[1].text.starts_with("[OCR ERROR] Page 2:"));
    assert_eq!(session.stats.failed_pages, 1);
    assert_eq!(recorder.page_errors.load(Ordering::SeqCst), 1);

    let cleans = model.requests(Call::Clean);
    assert!(cleans[0].prompt.contains("[OCR ERROR] Page 2:"));
    assert_eq!(session.state(), PipelineState::Ready);
}

#[tokio::test(start_paused = true)]
async fn one_failed_chunk_leaves_a_marker_between_good_parts() {
    let model = ScriptedModel::new().script(
        Call::Clean,
        vec![
            Ok("# Part one".into()),
            Err(RemoteError::permanent("content policy")),
        ],
    );

    let mut p = pipeline(
        config(None),
        FakeExtractor::new(12, &[]),
        CountingClassifier::handwritten(),
        model,
    );
    let session = p.run(b"%PDF").await.unwrap();

    assert_eq!(session.stats.failed_chunks, 1);
    let md = &session.cleaned_markdown;
    let one = md.find("# Part one").unwrap();
    let marker = md.find("[Error cleaning Part 2").unwrap();
    let three = md.find("# Cleaned part 3").unwrap();
    assert!(one < marker && marker < three);
}

#[tokio::test(start_paused = true)]
async fn all_chunks_failing_fails_the_run() {
    let recorder = Arc::new(StateRecorder::default());
    let model = ScriptedModel::new().script(
        Call::Clean,
        vec![
            Err(RemoteError::permanent("401 invalid api key")),
            Err(RemoteError::permanent("401 invalid api key")),
        ],
    );

    let mut p = pipeline(
        config(Some(recorder.clone())),
        FakeExtractor::new(7, &[]),
        CountingClassifier::handwritten(),
        model.clone(),
    );
    let err = p.run(b"%PDF").await.unwrap_err();

    match err {
        Pdf2DeckError::AllChunksFailed { total, first_error } => {
            assert_eq!(total, 2);
            assert!(first_error.contains("401"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(p.state(), Some(PipelineState::Failed));
    assert_eq!(
        recorder.states.lock().unwrap().last(),
        Some(&PipelineState::Failed)
    );
    assert_eq!(recorder.chunk_errors.load(Ordering::SeqCst), 2);
    assert!(model.requests(Call::Structure).is_empty());

    // A failed pipeline cannot be restarted.
    assert!(matches!(
        p.run(b"%PDF").await,
        Err(Pdf2DeckError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn blank_document_is_fatal() {
    struct Blank;
    impl PageExtractor for Blank {
        fn extract(&self, _pdf: &[u8]) -> Result<Vec<Page>, Pdf2DeckError> {
            Ok(vec![Page::digital(0, "   ".into())])
        }
    }

    let model = ScriptedModel::new();
    let mut p = Pipeline::new(config(None))
        .with_extractor(Arc::new(Blank))
        .with_client(model.clone());
    let err = p.run(b"%PDF").await.unwrap_err();
    assert!(matches!(err, Pdf2DeckError::NoExtractableText { .. }));
    assert_eq!(p.state(), Some(PipelineState::Failed));
    assert!(model.requests(Call::Clean).is_empty());
}

#[tokio::test]
async fn missing_credential_fails_before_extraction() {
    if std::env::var("MISTRAL_API_KEY").is_ok() {
        return;
    }
    let extractor = FakeExtractor::new(2, &[]);
    let config = PipelineConfig::builder()
        .provider_name("mistral")
        .local_ocr(None)
        .build()
        .unwrap();
    let mut p = Pipeline::new(config).with_extractor(extractor.clone());

    let err = p.run(b"%PDF").await.unwrap_err();
    match err {
        Pdf2DeckError::Credential { provider, hint } => {
            assert_eq!(provider, "mistral");
            assert!(hint.contains("MISTRAL_API_KEY"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(p.state(), Some(PipelineState::Failed));
}

#[tokio::test]
async fn missing_credential_fails_before_any_download() {
    if std::env::var("MISTRAL_API_KEY").is_ok() {
        return;
    }
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let server_hits = hits.clone();
    let server = tokio::spawn(async move {
        while let Ok((_socket, _)) = listener.accept().await {
            server_hits.fetch_add(1, Ordering::SeqCst);
        }
    });

    let config = PipelineConfig::builder()
        .provider_name("mistral")
        .local_ocr(None)
        .build()
        .unwrap();
    let mut p = Pipeline::new(config);

    let err = p
        .run_input(&format!("http://127.0.0.1:{port}/doc.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, Pdf2DeckError::Credential { .. }), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(p.state(), Some(PipelineState::Failed));
    server.abort();
}

#[tokio::test]
async fn unsupported_input_moves_to_failed() {
    let recorder = Arc::new(StateRecorder::default());
    let model = ScriptedModel::new();
    let extractor = FakeExtractor::new(2, &[]);
    let mut p = pipeline(
        config(Some(recorder.clone())),
        extractor.clone(),
        CountingClassifier::handwritten(),
        model.clone(),
    );

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"plain text, not a document").unwrap();

    let err = p.run_input(file.path().to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, Pdf2DeckError::UnsupportedFormat { .. }), "got {err:?}");
    assert_eq!(p.state(), Some(PipelineState::Failed));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert!(model.log.lock().unwrap().is_empty());
    assert_eq!(
        *recorder.states.lock().unwrap(),
        vec![PipelineState::Extracting, PipelineState::Failed]
    );
}

#[tokio::test]
async fn rejected_mutation_keeps_the_blueprint() {
    let recorder = Arc::new(StateRecorder::default());
    let model = ScriptedModel::new().script(
        Call::Mutate,
        vec![
            Ok("Sorry, I can't help with that.".into()),
            Ok(r#"[{"title":"Cells","content":["Membrane"]},{"title":"Summary","content":["Recap"]}]"#.into()),
        ],
    );

    let mut p = pipeline(
        config(Some(recorder.clone())),
        FakeExtractor::new(2, &[]),
        CountingClassifier::handwritten(),
        model.clone(),
    );
    let mut session = p.run(b"%PDF").await.unwrap();
    let before = session.blueprint().unwrap().clone();

    let err = session.mutate("Add a summary slide").await.unwrap_err();
    assert!(matches!(err, Pdf2DeckError::StructuringParse(_)));
    assert_eq!(session.blueprint(), Some(&before));
    assert_eq!(session.state(), PipelineState::Ready);

    let after = session.mutate("Add a summary slide").await.unwrap().clone();
    assert_eq!(after.len(), 2);
    assert_eq!(after.slides[1].title, "Summary");
    assert_eq!(session.blueprint(), Some(&after));

    // The second request carried the unchanged blueprint.
    let mutates = model.requests(Call::Mutate);
    assert_eq!(mutates.len(), 2);
    assert!(mutates[1].prompt.contains(&before.to_json().unwrap()));

    let states = recorder.states.lock().unwrap();
    let tail: Vec<_> = states.iter().rev().take(4).rev().copied().collect();
    assert_eq!(
        tail,
        vec![
            PipelineState::Mutating,
            PipelineState::Ready,
            PipelineState::Mutating,
            PipelineState::Ready,
        ]
    );
}

#[tokio::test]
async fn unparsed_structuring_is_kept_for_repair() {
    let model = ScriptedModel::new().script(
        Call::Structure,
        vec![Ok("Here are your slides: Cells, Energy".into())],
    );

    let mut p = pipeline(
        config(None),
        FakeExtractor::new(2, &[]),
        CountingClassifier::handwritten(),
        model,
    );
    let mut session = p.run(b"%PDF").await.unwrap();

    assert_eq!(session.state(), PipelineState::Ready);
    assert!(session.blueprint().is_none());
    assert_eq!(
        session.parse_error().unwrap().raw,
        "Here are your slides: Cells, Energy"
    );
    assert!(matches!(
        session.mutate("anything").await,
        Err(Pdf2DeckError::NotReady(_))
    ));

    let repaired = session
        .repair(r#"[{"title":"Cells"},{"content":["ATP"]}]"#)
        .unwrap();
    assert_eq!(repaired.slides[0].content, Vec::<String>::new());
    assert_eq!(repaired.slides[1].title, "Untitled Slide");
}

#[tokio::test]
async fn regenerate_uses_new_style_and_retained_text() {
    let model = ScriptedModel::new();
    let mut p = pipeline(
        config(None),
        FakeExtractor::new(2, &[]),
        CountingClassifier::handwritten(),
        model.clone(),
    );
    let mut session = p.run(b"%PDF").await.unwrap();

    session.regenerate(Some("One slide per page.")).await.unwrap();
    let structures = model.requests(Call::Structure);
    assert_eq!(structures.len(), 2);
    assert_eq!(structures[1].system.as_deref(), Some("One slide per page."));
    assert!(structures[1].prompt.contains(&session.cleaned_markdown));
}

#[tokio::test]
async fn single_image_runs_as_one_page_document() {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        16,
        16,
        image::Rgb([255, 255, 255]),
    ));
    let png = edgequake_pdf2deck::pipeline::encode::encode_png(&img).unwrap();

    let classifier = CountingClassifier::handwritten();
    let model = ScriptedModel::new();
    let mut p = Pipeline::new(config(None))
        .with_classifier(classifier.clone())
        .with_local_ocr(None)
        .with_client(model.clone());
    let session = p.run_image(&png).await.unwrap();

    assert_eq!(session.pages.len(), 1);
    assert_eq!(session.pages[0].engine_used, EngineUsed::OcrRemote);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    let sent = model.requests(Call::Vision)[0].image.clone().unwrap();
    assert!(sent.starts_with(b"\x89PNG"));
}
