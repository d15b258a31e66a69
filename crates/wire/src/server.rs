//! The TCP server and command router.
//!
//! One task per connection. A fresh connection with keys configured only
//! accepts AUTH inside `unauth_timeout`; success binds the key's
//! permission and rate-limit bucket and widens the deadline to
//! `idle_timeout`, refreshed on every accepted request. Engine work runs
//! on the blocking pool so fsyncs never stall the reactor.
//!
//! Errors go back as ERROR envelopes; the connection survives everything
//! except protocol errors and a failed handshake.

use crate::auth::{required_permission, requires_session, AuthTable, Permission};
use crate::frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
use crate::protocol::{
    decode_envelope, encode_response, Command, Envelope, Response, ResponseEnvelope,
    PROTOCOL_VERSION,
};
use crate::ratelimit::{RateLimitConfig, RateLimiterRegistry};
use gibram_core::{Error, Result};
use gibram_durability::wal::{Wal, WalRecordType};
use gibram_engine::backup::BackupManager;
use gibram_engine::community::ConnectedComponents;
use gibram_engine::engine::Engine;
use gibram_engine::ops::LoggedOp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server configuration.
#[derive(Clone)]
pub struct WireConfig {
    pub addr: String,
    pub max_frame_size: u32,
    /// Deadline for the AUTH handshake.
    pub unauth_timeout: Duration,
    /// Deadline between requests once authenticated.
    pub idle_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    /// No table (or an empty one) disables the handshake.
    pub auth: Option<AuthTable>,
}

impl Default for WireConfig {
    fn default() -> Self {
        WireConfig {
            addr: "127.0.0.1:7667".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            unauth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            rate_limit: RateLimitConfig::default(),
            auth: None,
        }
    }
}

/// Everything the router needs to serve requests.
#[derive(Clone)]
pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub wal: Arc<Wal>,
    pub backups: Arc<BackupManager>,
}

/// The wire server.
pub struct Server {
    ctx: ServerContext,
    config: WireConfig,
    limiters: RateLimiterRegistry,
}

#[derive(Clone)]
struct ConnAuth {
    key: String,
    permission: Permission,
}

impl Server {
    pub fn new(ctx: ServerContext, config: WireConfig) -> Arc<Self> {
        let limiters = RateLimiterRegistry::new(config.rate_limit);
        Arc::new(Server {
            ctx,
            config,
            limiters,
        })
    }

    fn auth_required(&self) -> bool {
        self.config
            .auth
            .as_ref()
            .map(|table| !table.is_empty())
            .unwrap_or(false)
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.serve_on(listener, token).await
    }

    /// Serve on an already-bound listener until cancelled.
    ///
    /// Cancellation stops accepting; connections in flight run their
    /// current request to completion.
    pub async fn serve_on(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<()> {
        info!(addr = %listener.local_addr()?, "server listening");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("listener stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            let conn_token = token.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer, conn_token).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) {
        debug!(%peer, "connection accepted");
        let (mut reader, mut writer) = stream.into_split();
        let mut auth: Option<ConnAuth> = None;

        loop {
            let deadline = if self.auth_required() && auth.is_none() {
                self.config.unauth_timeout
            } else {
                self.config.idle_timeout
            };

            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = tokio::time::timeout(
                    deadline,
                    read_frame(&mut reader, self.config.max_frame_size),
                ) => read,
            };

            let payload = match read {
                Err(_) => {
                    debug!(%peer, "connection deadline lapsed");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(payload))) => payload,
                Ok(Err(e)) => {
                    let _ = respond(&mut writer, 0, Response::from_error(&e)).await;
                    break;
                }
            };

            let envelope = match decode_envelope(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    let _ = respond(&mut writer, 0, Response::from_error(&e)).await;
                    break;
                }
            };
            if envelope.version != PROTOCOL_VERSION {
                let e = Error::Protocol(format!(
                    "unsupported protocol version {}",
                    envelope.version
                ));
                let _ = respond(&mut writer, envelope.request_id, Response::from_error(&e)).await;
                break;
            }
            let request_id = envelope.request_id;

            // The handshake is handled inline; everything else dispatches.
            if let Command::Auth { api_key } = &envelope.command {
                match &self.config.auth {
                    Some(table) if !table.is_empty() => match table.validate(api_key) {
                        Some(permission) => {
                            debug!(%peer, "connection authenticated");
                            auth = Some(ConnAuth {
                                key: api_key.clone(),
                                permission,
                            });
                            if respond(&mut writer, request_id, Response::Ok).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        None => {
                            let e = Error::Auth("invalid api key".to_string());
                            let _ =
                                respond(&mut writer, request_id, Response::from_error(&e)).await;
                            break;
                        }
                    },
                    _ => {
                        // No keys configured; AUTH is a no-op.
                        if respond(&mut writer, request_id, Response::Ok).await.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
            if self.auth_required() && auth.is_none() {
                let e = Error::Auth("authentication required".to_string());
                let _ = respond(&mut writer, request_id, Response::from_error(&e)).await;
                break;
            }

            let server = self.clone();
            let conn_auth = auth.clone();
            let response = match tokio::task::spawn_blocking(move || {
                server.dispatch(conn_auth.as_ref(), &envelope, 0)
            })
            .await
            {
                Ok(response) => response,
                Err(e) => Response::Error {
                    message: format!("request handler failed: {e}"),
                    code: -1,
                },
            };

            if respond(&mut writer, request_id, response).await.is_err() {
                break;
            }
        }
        debug!(%peer, "connection closed");
    }

    /// Permission check, rate limit, session requirement, then the handler.
    fn dispatch(&self, auth: Option<&ConnAuth>, envelope: &Envelope, depth: usize) -> Response {
        // Connections without a configured handshake act unrestricted.
        let permission = auth.map(|a| a.permission).unwrap_or(Permission::Admin);
        let required = required_permission(&envelope.command);
        if !permission.allows(required) {
            return Response::from_error(&Error::Permission(format!(
                "command requires {required:?} permission"
            )));
        }

        // Pipelines charge per sub-command, not for the wrapper.
        let is_pipeline = matches!(envelope.command, Command::Pipeline { .. });
        if !is_pipeline {
            if let Some(auth) = auth {
                if !self.limiters.try_acquire(&auth.key) {
                    return Response::from_error(&Error::RateLimited(auth.key.clone()));
                }
            }
        }

        if requires_session(&envelope.command) && envelope.session_id.is_empty() {
            return Response::from_error(&Error::Invalid(
                "command requires a session id".to_string(),
            ));
        }

        match self.handle(auth, envelope, depth) {
            Ok(response) => response,
            Err(e) => Response::from_error(&e),
        }
    }

    fn handle(
        &self,
        auth: Option<&ConnAuth>,
        envelope: &Envelope,
        depth: usize,
    ) -> Result<Response> {
        let engine = &self.ctx.engine;
        let wal = &self.ctx.wal;
        let sid = envelope.session_id.as_str();

        let response = match &envelope.command {
            Command::Auth { .. } => {
                return Err(Error::Protocol(
                    "AUTH must be the first command on a connection".to_string(),
                ))
            }
            Command::Ping => Response::Pong,
            Command::Health => Response::Health { ok: true },
            Command::Info => {
                if sid.is_empty() {
                    Response::Info(engine.info())
                } else {
                    Response::Session(engine.info_for_session(sid)?)
                }
            }

            Command::SessionList => Response::Sessions(engine.list_sessions()),
            Command::SessionInfo => Response::Session(engine.info_for_session(sid)?),
            Command::SessionDelete => {
                engine.session(sid)?;
                engine.execute(LoggedOp::DeleteSession {
                    session: sid.to_string(),
                })?;
                Response::Ok
            }
            Command::SessionTouch => {
                engine.session(sid)?.touch();
                Response::Ok
            }
            Command::SessionSetTtl {
                ttl_secs,
                idle_ttl_secs,
            } => {
                engine.execute(LoggedOp::SetSessionTtl {
                    session: sid.to_string(),
                    ttl_secs: *ttl_secs,
                    idle_ttl_secs: *idle_ttl_secs,
                })?;
                Response::Ok
            }

            Command::AddDocument {
                external_id,
                filename,
            } => Response::Created {
                id: engine
                    .execute(LoggedOp::AddDocument {
                        session: sid.to_string(),
                        external_id: external_id.clone(),
                        filename: filename.clone(),
                    })?
                    .id(),
            },
            Command::GetDocument { id } => {
                Response::Document(engine.session(sid)?.get_document(*id))
            }
            Command::GetDocumentByExternal { external_id } => {
                Response::Document(engine.session(sid)?.get_document_by_external(external_id))
            }
            Command::DeleteDocument { id } => {
                engine.execute(LoggedOp::DeleteDocument {
                    session: sid.to_string(),
                    id: *id,
                })?;
                Response::Ok
            }

            Command::AddTextUnit {
                external_id,
                document_id,
                content,
                embedding,
                token_count,
            } => Response::Created {
                id: engine
                    .execute(LoggedOp::AddTextUnit {
                        session: sid.to_string(),
                        external_id: external_id.clone(),
                        document_id: *document_id,
                        content: content.clone(),
                        embedding: embedding.clone(),
                        token_count: *token_count,
                    })?
                    .id(),
            },
            Command::GetTextUnit { id } => {
                Response::TextUnit(engine.session(sid)?.get_text_unit(*id))
            }
            Command::GetTextUnitByExternal { external_id } => {
                Response::TextUnit(engine.session(sid)?.get_text_unit_by_external(external_id))
            }
            Command::DeleteTextUnit { id } => {
                engine.execute(LoggedOp::DeleteTextUnit {
                    session: sid.to_string(),
                    id: *id,
                })?;
                Response::Ok
            }

            Command::AddEntity {
                external_id,
                title,
                entity_type,
                description,
                embedding,
            } => Response::Created {
                id: engine
                    .execute(LoggedOp::AddEntity {
                        session: sid.to_string(),
                        external_id: external_id.clone(),
                        title: title.clone(),
                        entity_type: entity_type.clone(),
                        description: description.clone(),
                        embedding: embedding.clone(),
                    })?
                    .id(),
            },
            Command::AddEntities { entities } => {
                let mut ids = Vec::with_capacity(entities.len());
                for spec in entities {
                    ids.push(
                        engine
                            .execute(LoggedOp::AddEntity {
                                session: sid.to_string(),
                                external_id: spec.external_id.clone(),
                                title: spec.title.clone(),
                                entity_type: spec.entity_type.clone(),
                                description: spec.description.clone(),
                                embedding: spec.embedding.clone(),
                            })?
                            .id(),
                    );
                }
                Response::CreatedMany { ids }
            }
            Command::GetEntity { id } => Response::Entity(engine.session(sid)?.get_entity(*id)),
            Command::GetEntities { ids } => {
                let session = engine.session(sid)?;
                let records = ids
                    .iter()
                    .filter_map(|id| session.get_entity(*id))
                    .collect();
                Response::Entities {
                    records,
                    next_cursor: 0,
                }
            }
            Command::GetEntityByTitle { title } => {
                Response::Entity(engine.session(sid)?.get_entity_by_title(title))
            }
            Command::UpdateEntityDescription {
                id,
                description,
                embedding,
            } => {
                engine.execute(LoggedOp::UpdateEntityDescription {
                    session: sid.to_string(),
                    id: *id,
                    description: description.clone(),
                    embedding: embedding.clone(),
                })?;
                Response::Ok
            }
            Command::DeleteEntity { id } => {
                engine.execute(LoggedOp::DeleteEntity {
                    session: sid.to_string(),
                    id: *id,
                })?;
                Response::Ok
            }
            Command::ListEntities { after_id, limit } => {
                let (records, next_cursor) = engine.session(sid)?.list_entities(*after_id, *limit);
                Response::Entities {
                    records,
                    next_cursor,
                }
            }

            Command::AddRelationship {
                external_id,
                source,
                target,
                rel_type,
                description,
                weight,
            } => Response::Created {
                id: engine
                    .execute(LoggedOp::AddRelationship {
                        session: sid.to_string(),
                        external_id: external_id.clone(),
                        source: *source,
                        target: *target,
                        rel_type: rel_type.clone(),
                        description: description.clone(),
                        weight: *weight,
                    })?
                    .id(),
            },
            Command::GetRelationship { id } => {
                Response::Relationship(engine.session(sid)?.get_relationship(*id))
            }
            Command::GetRelationshipBetween { source, target } => Response::Relationship(
                engine
                    .session(sid)?
                    .get_relationship_between(*source, *target),
            ),
            Command::DeleteRelationship { id } => {
                engine.execute(LoggedOp::DeleteRelationship {
                    session: sid.to_string(),
                    id: *id,
                })?;
                Response::Ok
            }
            Command::ListRelationships { after_id, limit } => {
                let (records, next_cursor) =
                    engine.session(sid)?.list_relationships(*after_id, *limit);
                Response::Relationships {
                    records,
                    next_cursor,
                }
            }

            Command::AddCommunity {
                external_id,
                title,
                summary,
                content,
                level,
                entity_ids,
                relationship_ids,
                embedding,
            } => Response::Created {
                id: engine
                    .execute(LoggedOp::AddCommunity {
                        session: sid.to_string(),
                        external_id: external_id.clone(),
                        title: title.clone(),
                        summary: summary.clone(),
                        content: content.clone(),
                        level: *level,
                        entity_ids: entity_ids.clone(),
                        relationship_ids: relationship_ids.clone(),
                        embedding: embedding.clone(),
                    })?
                    .id(),
            },
            Command::GetCommunity { id } => {
                Response::Community(engine.session(sid)?.get_community(*id))
            }
            Command::DeleteCommunity { id } => {
                engine.execute(LoggedOp::DeleteCommunity {
                    session: sid.to_string(),
                    id: *id,
                })?;
                Response::Ok
            }
            Command::ComputeCommunities { level } => Response::CreatedMany {
                ids: engine.compute_communities(sid, *level, &ConnectedComponents)?,
            },
            Command::ComputeCommunityHierarchy { max_levels } => Response::CommunityLevels(
                engine.compute_community_hierarchy(sid, *max_levels, &ConnectedComponents)?,
            ),

            Command::LinkTextUnit {
                text_unit_id,
                entity_id,
            } => {
                engine.execute(LoggedOp::LinkTextUnitToEntity {
                    session: sid.to_string(),
                    text_unit_id: *text_unit_id,
                    entity_id: *entity_id,
                })?;
                Response::Ok
            }
            Command::GetNeighbors { entity_id } => {
                Response::Neighbors(engine.session(sid)?.get_neighbors(*entity_id)?)
            }

            Command::Query { spec } => Response::Query(engine.query(sid, spec.clone())?),
            Command::Explain { query_id } => Response::Explain(engine.explain(*query_id)?),

            Command::Save => Response::Saved {
                path: self.ctx.backups.save()?.display().to_string(),
            },
            Command::BgSave => {
                self.ctx.backups.bgsave()?;
                Response::Ok
            }
            Command::LastSave => Response::LastSave {
                at_secs: self.ctx.backups.last_save_secs(),
            },
            Command::BgRestore => {
                self.ctx.backups.bgrestore()?;
                Response::Ok
            }
            Command::BackupStatus => Response::Backup(self.ctx.backups.status()),

            Command::WalStatus => Response::WalStatus {
                current_lsn: wal.current_lsn(),
                flushed_lsn: wal.flushed_lsn(),
                segment_count: wal.segment_count()? as u64,
                total_size: wal.total_size()?,
            },
            Command::WalCheckpoint => {
                let lsn = wal.append(WalRecordType::Checkpoint, b"", b"")?;
                wal.sync()?;
                Response::Checkpointed { lsn }
            }
            Command::WalTruncate { lsn } => Response::Truncated {
                segments_removed: wal.truncate_before(*lsn)? as u64,
            },
            Command::WalRotate => {
                wal.rotate()?;
                Response::Ok
            }

            Command::Pipeline { requests } => {
                if depth > 0 {
                    return Err(Error::Protocol("nested pipeline".to_string()));
                }
                let mut responses = Vec::with_capacity(requests.len());
                for request in requests {
                    let response = if request.version != PROTOCOL_VERSION {
                        Response::from_error(&Error::Protocol(format!(
                            "unsupported protocol version {}",
                            request.version
                        )))
                    } else {
                        self.dispatch(auth, request, depth + 1)
                    };
                    responses.push(ResponseEnvelope::new(request.request_id, response));
                }
                Response::Pipeline(responses)
            }
        };
        Ok(response)
    }
}

async fn respond<W>(writer: &mut W, request_id: u64, response: Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(&ResponseEnvelope::new(request_id, response))?;
    write_frame(writer, &bytes).await
}
