use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{
    EdgeKind, GraphEdge, GraphNode, GraphOverview, GraphScope, NodeId, NodeKind, SourceSpan,
};
use crate::store::{GraphStore, NamePattern, WriteReport, migrations, sort_nodes};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Max ids bound into a single `IN (...)` clause.
const ID_CHUNK: usize = 400;

const NODE_COLUMNS: &str = "id, repository, revision, kind, name, qualname, path, start_line, \
     start_col, end_line, end_col, has_span, language, depth, signature, text";

#[derive(Debug)]
struct ConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

/// SQLite-backed graph store. Writes go through one serialized connection,
/// reads through a pool so retrieval does not queue behind ingestion.
pub struct SqliteGraphStore {
    db_path: PathBuf,
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl SqliteGraphStore {
    pub fn open(db_path: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!("create {}: {err}", parent.display()))
            })?;
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let write_conn = Connection::open(db_path)?;
        write_conn.busy_timeout(busy_timeout)?;
        write_conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&write_conn)?;
        let write_conn = Arc::new(Mutex::new(write_conn));

        let manager = SqliteConnectionManager::file(db_path);
        let read_pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .connection_customizer(Box::new(ConnectionCustomizer { busy_timeout }))
            .build(manager)?;

        tracing::debug!(
            path = %db_path.display(),
            pool_size = config.pool_size,
            "graph store opened"
        );

        Ok(Self {
            db_path: db_path.to_path_buf(),
            write_conn,
            read_pool,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.write_conn
            .lock()
            .map_err(|_| StoreError::Unavailable("write connection poisoned".to_string()))
    }

    fn read_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.read_pool.get()?)
    }

    fn query_nodes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<GraphNode>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, NodeRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_node()?);
        }
        Ok(out)
    }
}

impl GraphStore for SqliteGraphStore {
    fn write_batch(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
    ) -> Result<WriteReport, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut report = WriteReport::default();
        {
            let mut insert_node = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO nodes ({NODE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))?;
            for node in nodes {
                let span = node.span.as_ref();
                report.nodes_inserted += insert_node.execute(params![
                    node.id.as_str(),
                    node.repository,
                    node.revision,
                    node.kind.as_str(),
                    node.name,
                    node.qualname,
                    node.file_path(),
                    span.map(|s| s.start_line).unwrap_or(0),
                    span.map(|s| s.start_col).unwrap_or(0),
                    span.map(|s| s.end_line).unwrap_or(0),
                    span.map(|s| s.end_col).unwrap_or(0),
                    span.is_some() as i64,
                    node.language,
                    node.depth as i64,
                    node.signature,
                    node.text,
                ])?;
            }

            let mut node_exists = tx.prepare_cached("SELECT 1 FROM nodes WHERE id = ?1")?;
            let mut insert_edge = tx.prepare_cached(
                "INSERT OR IGNORE INTO edges (source_id, target_id, kind) VALUES (?1, ?2, ?3)",
            )?;
            for edge in edges {
                for endpoint in [&edge.source, &edge.target] {
                    if !node_exists.exists([endpoint.as_str()])? {
                        return Err(StoreError::DanglingEdge {
                            source_id: edge.source.to_string(),
                            target_id: edge.target.to_string(),
                            kind: edge.kind.to_string(),
                        });
                    }
                }
                report.edges_inserted += insert_edge.execute(params![
                    edge.source.as_str(),
                    edge.target.as_str(),
                    edge.kind.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(report)
    }

    fn get_node(&self, id: &NodeId) -> Result<Option<GraphNode>, StoreError> {
        let conn = self.read_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                [id.as_str()],
                NodeRow::from_row,
            )
            .optional()?;
        row.map(NodeRow::into_node).transpose()
    }

    fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<GraphNode>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({})",
                placeholders(chunk.len())
            );
            out.extend(self.query_nodes(&sql, params_from_iter(chunk.iter().map(|id| id.as_str())))?);
        }
        Ok(out)
    }

    fn edges_touching(
        &self,
        ids: &[NodeId],
        kinds: &[EdgeKind],
    ) -> Result<Vec<GraphEdge>, StoreError> {
        let conn = self.read_conn()?;
        let mut out = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let marks = placeholders(chunk.len());
            let sql = format!(
                "SELECT source_id, target_id, kind FROM edges
                 WHERE source_id IN ({marks}) OR target_id IN ({marks})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let bound = chunk.iter().chain(chunk.iter()).map(|id| id.as_str());
            let rows = stmt.query_map(params_from_iter(bound), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (source, target, kind) = row?;
                let kind: EdgeKind = kind.parse().map_err(StoreError::Corrupt)?;
                if kinds.is_empty() || kinds.contains(&kind) {
                    out.push(GraphEdge::new(NodeId(source), NodeId(target), kind));
                }
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    fn find_by_name(
        &self,
        scope: &GraphScope,
        pattern: &NamePattern,
        kind: Option<NodeKind>,
    ) -> Result<Vec<GraphNode>, StoreError> {
        if pattern.is_empty() && !pattern.as_str().contains('*') {
            return Ok(Vec::new());
        }
        let column = if pattern.targets_qualname() {
            "qualname"
        } else {
            "name"
        };
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE repository = ?1 AND revision = ?2
               AND {column} LIKE ?3 ESCAPE '\\'
               AND (?4 IS NULL OR kind = ?4)"
        );
        let mut nodes = self.query_nodes(
            &sql,
            params![
                scope.repository,
                scope.revision,
                pattern.to_like(),
                kind.map(|k| k.as_str()),
            ],
        )?;
        nodes.retain(|node| pattern.matches_node(node));
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    fn nodes_in_file(&self, scope: &GraphScope, path: &str) -> Result<Vec<GraphNode>, StoreError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE repository = ?1 AND revision = ?2 AND path = ?3 AND has_span = 1"
        );
        let mut nodes = self.query_nodes(&sql, params![scope.repository, scope.revision, path])?;
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    fn find_by_text(
        &self,
        scope: &GraphScope,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, StoreError> {
        if needle.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE repository = ?1 AND revision = ?2 AND kind = 'file'
               AND text IS NOT NULL AND instr(lower(text), ?3) > 0
             ORDER BY path, id
             LIMIT ?4"
        );
        self.query_nodes(
            &sql,
            params![
                scope.repository,
                scope.revision,
                needle.to_ascii_lowercase(),
                limit as i64,
            ],
        )
    }

    fn record_revision(&self, scope: &GraphScope) -> Result<(), StoreError> {
        let recorded = chrono::Utc::now().timestamp();
        self.conn()?.execute(
            "INSERT INTO revisions (repository, revision, recorded, seq)
             VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(seq), 0) + 1 FROM revisions))
             ON CONFLICT(repository, revision) DO UPDATE
               SET recorded = excluded.recorded, seq = excluded.seq",
            params![scope.repository, scope.revision, recorded],
        )?;
        Ok(())
    }

    fn latest_revision(&self, repository: &str) -> Result<Option<String>, StoreError> {
        let conn = self.read_conn()?;
        let revision = conn
            .query_row(
                "SELECT revision FROM revisions WHERE repository = ?1
                 ORDER BY seq DESC LIMIT 1",
                [repository],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(revision)
    }

    fn overview(&self, scope: &GraphScope) -> Result<GraphOverview, StoreError> {
        let conn = self.read_conn()?;
        let mut overview = GraphOverview {
            repository: scope.repository.clone(),
            revision: scope.revision.clone(),
            ..GraphOverview::default()
        };

        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM nodes
             WHERE repository = ?1 AND revision = ?2 GROUP BY kind",
        )?;
        let rows = stmt.query_map(params![scope.repository, scope.revision], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            overview.nodes.insert(kind, count as usize);
        }

        let mut stmt = conn.prepare(
            "SELECT e.kind, COUNT(*) FROM edges e
             JOIN nodes n ON n.id = e.source_id
             WHERE n.repository = ?1 AND n.revision = ?2 GROUP BY e.kind",
        )?;
        let rows = stmt.query_map(params![scope.repository, scope.revision], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            overview.edges.insert(kind, count as usize);
        }

        let mut stmt = conn.prepare(
            "SELECT language, COUNT(*) FROM nodes
             WHERE repository = ?1 AND revision = ?2 AND kind = 'file'
               AND language IS NOT NULL
             GROUP BY language",
        )?;
        let rows = stmt.query_map(params![scope.repository, scope.revision], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (language, count) = row?;
            overview.languages.insert(language, count as usize);
        }

        Ok(overview)
    }

    fn scope_contents(
        &self,
        scope: &GraphScope,
    ) -> Result<(Vec<NodeId>, Vec<GraphEdge>), StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM nodes WHERE repository = ?1 AND revision = ?2")?;
        let ids = stmt
            .query_map(params![scope.repository, scope.revision], |row| {
                row.get::<_, String>(0).map(NodeId)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT e.source_id, e.target_id, e.kind FROM edges e
             JOIN nodes n ON n.id = e.source_id
             WHERE n.repository = ?1 AND n.revision = ?2",
        )?;
        let rows = stmt.query_map(params![scope.repository, scope.revision], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let (source, target, kind) = row?;
            let kind: EdgeKind = kind.parse().map_err(StoreError::Corrupt)?;
            edges.push(GraphEdge::new(NodeId(source), NodeId(target), kind));
        }
        Ok((ids, edges))
    }
}

struct NodeRow {
    id: String,
    repository: String,
    revision: String,
    kind: String,
    name: String,
    qualname: String,
    path: String,
    start_line: i64,
    start_col: i64,
    end_line: i64,
    end_col: i64,
    has_span: bool,
    language: Option<String>,
    depth: i64,
    signature: Option<String>,
    text: Option<String>,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository: row.get(1)?,
            revision: row.get(2)?,
            kind: row.get(3)?,
            name: row.get(4)?,
            qualname: row.get(5)?,
            path: row.get(6)?,
            start_line: row.get(7)?,
            start_col: row.get(8)?,
            end_line: row.get(9)?,
            end_col: row.get(10)?,
            has_span: row.get::<_, i64>(11)? != 0,
            language: row.get(12)?,
            depth: row.get(13)?,
            signature: row.get(14)?,
            text: row.get(15)?,
        })
    }

    fn into_node(self) -> Result<GraphNode, StoreError> {
        let kind: NodeKind = self.kind.parse().map_err(StoreError::Corrupt)?;
        let span = self.has_span.then(|| SourceSpan {
            file: self.path,
            start_line: self.start_line,
            start_col: self.start_col,
            end_line: self.end_line,
            end_col: self.end_col,
        });
        Ok(GraphNode {
            id: NodeId(self.id),
            kind,
            name: self.name,
            qualname: self.qualname,
            span,
            language: self.language,
            depth: u32::try_from(self.depth)
                .map_err(|_| StoreError::Corrupt(format!("negative depth {}", self.depth)))?,
            signature: self.signature,
            repository: self.repository,
            revision: self.revision,
            text: self.text,
        })
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::{edge, file_node, scope, symbol_node};

    fn open_store() -> (tempfile::TempDir, SqliteGraphStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteGraphStore::open(&dir.path().join("graph.db"), &StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn replaying_a_batch_is_a_no_op() {
        let (_dir, store) = open_store();
        let scope = scope("v1");
        let file = file_node(&scope, "a.py");
        let func = symbol_node(&scope, "a.py", "helper", NodeKind::Function, 3);
        let nodes = vec![file.clone(), func.clone()];
        let edges = vec![edge(&file, &func, EdgeKind::Contains)];

        let first = store.write_batch(&nodes, &edges).unwrap();
        assert_eq!(first.nodes_inserted, 2);
        assert_eq!(first.edges_inserted, 1);
        let digest = store.digest(&scope).unwrap();

        let second = store.write_batch(&nodes, &edges).unwrap();
        assert_eq!(second, WriteReport::default());
        assert_eq!(store.digest(&scope).unwrap(), digest);
        assert_eq!(store.get_node(&func.id).unwrap(), Some(func));
    }

    #[test]
    fn dangling_edge_rolls_back_the_batch() {
        let (_dir, store) = open_store();
        let scope = scope("v1");
        let file = file_node(&scope, "a.py");
        let ghost = symbol_node(&scope, "b.py", "ghost", NodeKind::Function, 1);
        let err = store
            .write_batch(&[file.clone()], &[edge(&file, &ghost, EdgeKind::Calls)])
            .unwrap_err();
        assert!(matches!(err, StoreError::DanglingEdge { .. }));
        assert!(store.get_node(&file.id).unwrap().is_none());
    }

    #[test]
    fn edges_may_target_nodes_from_earlier_batches() {
        let (_dir, store) = open_store();
        let scope = scope("v1");
        let a = symbol_node(&scope, "a.py", "a", NodeKind::Function, 1);
        let b = symbol_node(&scope, "b.py", "b", NodeKind::Function, 1);
        store.write_batch(&[a.clone()], &[]).unwrap();
        store
            .write_batch(&[b.clone()], &[edge(&b, &a, EdgeKind::Calls)])
            .unwrap();
        let edges = store.edges_touching(&[a.id.clone()], &[EdgeKind::Calls]).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(store.edges_touching(&[a.id.clone()], &[EdgeKind::Imports]).unwrap().is_empty());
    }

    #[test]
    fn find_by_name_supports_globs_and_kinds() {
        let (_dir, store) = open_store();
        let scope = scope("v1");
        let nodes = vec![
            symbol_node(&scope, "b.py", "parse_file", NodeKind::Function, 10),
            symbol_node(&scope, "a.py", "parse_args", NodeKind::Function, 2),
            symbol_node(&scope, "a.py", "Parser", NodeKind::Type, 1),
        ];
        store.write_batch(&nodes, &[]).unwrap();

        let found = store
            .find_by_name(&scope, &NamePattern::new("parse*"), None)
            .unwrap();
        let names: Vec<&str> = found.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Parser", "parse_args", "parse_file"]);

        let types = store
            .find_by_name(&scope, &NamePattern::new("parse*"), Some(NodeKind::Type))
            .unwrap();
        assert_eq!(types.len(), 1);

        let other = scope_other();
        assert!(store
            .find_by_name(&other, &NamePattern::new("parse*"), None)
            .unwrap()
            .is_empty());
    }

    fn scope_other() -> GraphScope {
        scope("v2")
    }

    #[test]
    fn find_by_text_searches_file_sources_of_one_revision() {
        let (_dir, store) = open_store();
        let v1 = scope("v1");
        let mut a = file_node(&v1, "a.py");
        a.text = Some("raise ValueError(\"Negative Amount\")\n".to_string());
        let mut b = file_node(&v1, "b.py");
        b.text = Some("x = 1\n".to_string());
        let mut old = file_node(&scope("v0"), "a.py");
        old.text = a.text.clone();
        store.write_batch(&[a.clone(), b, old], &[]).unwrap();

        let found = store.find_by_text(&v1, "negative amount", 10).unwrap();
        assert_eq!(found, vec![a]);
        assert!(store.find_by_text(&v1, "missing", 10).unwrap().is_empty());
        assert!(store.find_by_text(&v1, "  ", 10).unwrap().is_empty());
        assert!(store.find_by_text(&v1, "x = 1", 0).unwrap().is_empty());
    }

    #[test]
    fn latest_revision_follows_record_order() {
        let (_dir, store) = open_store();
        assert_eq!(store.latest_revision("/repo").unwrap(), None);
        store.record_revision(&scope("v1")).unwrap();
        store.record_revision(&scope("v2")).unwrap();
        assert_eq!(store.latest_revision("/repo").unwrap().as_deref(), Some("v2"));
        store.record_revision(&scope("v1")).unwrap();
        assert_eq!(store.latest_revision("/repo").unwrap().as_deref(), Some("v1"));
    }

    #[test]
    fn overview_counts_kinds_and_languages() {
        let (_dir, store) = open_store();
        let scope = scope("v1");
        let file = file_node(&scope, "a.py");
        let func = symbol_node(&scope, "a.py", "helper", NodeKind::Function, 3);
        store
            .write_batch(
                &[file.clone(), func.clone()],
                &[edge(&file, &func, EdgeKind::Contains)],
            )
            .unwrap();
        let overview = store.overview(&scope).unwrap();
        assert_eq!(overview.nodes.get("file"), Some(&1));
        assert_eq!(overview.nodes.get("function"), Some(&1));
        assert_eq!(overview.edges.get("contains"), Some(&1));
        assert_eq!(overview.languages.get("python"), Some(&1));
        assert_eq!(store.nodes_in_file(&scope, "a.py").unwrap().len(), 2);
    }
}
