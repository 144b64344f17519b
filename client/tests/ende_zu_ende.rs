//! Ende-zu-Ende: Client gegen einen minimalen Koordinationsserver im Test
//!
//! Der Server beantwortet keine Verhandlung, dadurch faellt die Verbindung
//! auf den Relay zurueck und das Relay-Audio muss im Standard-Bus landen.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use klangraum_audio::{BusDefinition, SinkRef};
use klangraum_client::config::ClientConfig;
use klangraum_client::Client;
use klangraum_core::{
    AudioFormat, AudioFrame, BetriebsModus, BusId, KlangraumEvent, Participant, ParticipantId,
    PeerZustand,
};
use klangraum_protocol::{FrameCodec, KanalNachricht, RaumEreignis, RelayFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

type ServerSeite = Framed<TcpStream, FrameCodec<KanalNachricht>>;

fn test_config(signaling: String) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.signaling.adresse = signaling;
    config.verbindung.modus = BetriebsModus::Auto;
    config.verbindung.verhandlungs_timeout_ms = 100;
    config.verbindung.udp_bind = "127.0.0.1:0".parse().unwrap();
    config.audio.kanaele = 1;
    config.audio.standard_bus = Some("haupt".into());
    config.busse = vec![BusDefinition::neu("haupt", SinkRef::Speicher)];
    config.observability.aktiviert = false;
    config.observability.intervall_ms = 20;
    config
}

async fn client_mit_server() -> (Client, ServerSeite) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let adresse = listener.local_addr().unwrap().to_string();
    let client = Client::starten(test_config(adresse)).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    (client, Framed::new(stream, FrameCodec::new()))
}

fn relay_audio(von: ParticipantId, sequenz: u32) -> KanalNachricht {
    let frame = AudioFrame::neu(
        von,
        AudioFormat::neu(48000, 1),
        u64::from(sequenz) * 10_000,
        vec![0.5; 480],
    );
    KanalNachricht::RelayAudio {
        von: Some(von),
        daten: RelayFrame::aus_frame(sequenz, &frame).encode(),
    }
}

#[tokio::test]
async fn rueckfall_auf_relay_und_audio_im_standard_bus() {
    let (client, mut server) = client_mit_server().await;
    let mut ereignisse = client.ereignisse().abonnieren();
    let pid = ParticipantId::new();

    server
        .send(KanalNachricht::Raum(RaumEreignis::Beigetreten {
            teilnehmer: Participant::neu(pid, "anna"),
            initiator: true,
        }))
        .await
        .unwrap();

    // Angebot bleibt unbeantwortet; nach dem Timeout kommt RelayAktivieren
    let aktiviert = timeout(Duration::from_secs(3), async {
        while let Some(Ok(nachricht)) = server.next().await {
            if nachricht == KanalNachricht::RelayAktivieren {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(aktiviert);

    for sequenz in 0..10 {
        server.send(relay_audio(pid, sequenz)).await.unwrap();
    }

    let abzug = client.speicher_abzug(&BusId::new("haupt")).unwrap();
    let gehoert = timeout(Duration::from_secs(3), async {
        loop {
            let bloecke = abzug.entnehmen();
            if bloecke
                .iter()
                .any(|b| b.iter().any(|s| (s - 0.5).abs() < 1e-6))
            {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(gehoert, "Relay-Audio fehlt im Standard-Bus");

    assert_eq!(
        client.supervisor().zustand(pid).await.unwrap(),
        Some(PeerZustand::RelayVerbunden)
    );
    let zuweisungen = client.matrix().zuweisungen(&pid);
    assert_eq!(zuweisungen.len(), 1);
    assert_eq!(zuweisungen[0].bus_id, BusId::new("haupt"));

    let mut folge = Vec::new();
    while let Ok(ereignis) = ereignisse.try_recv() {
        if let KlangraumEvent::StatusGeaendert {
            participant_id,
            neu,
            ..
        } = ereignis
        {
            if participant_id == pid {
                folge.push(neu);
            }
        }
    }
    assert_eq!(
        folge,
        vec![
            PeerZustand::Verhandlung,
            PeerZustand::Rueckfall,
            PeerZustand::RelayVerbunden
        ]
    );

    // Metriken werden aus Supervisor und Mixer uebernommen
    sleep(Duration::from_millis(100)).await;
    assert!(client.metriken().relay_empfangen.get() >= 1);
    assert!(client.metriken().mixer_zyklen.get() > 0);

    client.beenden().await;
}

#[tokio::test]
async fn neu_laden_tauscht_busse_ohne_verbindungen_zu_trennen() {
    let (mut client, mut server) = client_mit_server().await;
    let pid = ParticipantId::new();
    server
        .send(KanalNachricht::Raum(RaumEreignis::Beigetreten {
            teilnehmer: Participant::neu(pid, "ben"),
            initiator: false,
        }))
        .await
        .unwrap();

    let verbunden = timeout(Duration::from_secs(2), async {
        loop {
            if client.supervisor().zustand(pid).await.unwrap().is_some() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(verbunden.is_ok());

    let mut neue = client.config().clone();
    neue.busse.push(BusDefinition::neu("stream", SinkRef::Null));
    let bericht = client.neu_laden(neue).unwrap();
    assert_eq!(bericht.erstellt, vec![BusId::new("stream")]);
    assert!(bericht.entfernt.is_empty());

    let mut busse = client.matrix().busse();
    busse.sort();
    assert_eq!(busse, vec![BusId::new("haupt"), BusId::new("stream")]);
    assert!(client.supervisor().zustand(pid).await.unwrap().is_some());
    assert_eq!(client.metriken().busse_aktiv.get(), 2);

    // Standard-Bus auf einen fehlenden Bus: abgelehnt, nichts geaendert
    let mut kaputt = client.config().clone();
    kaputt.busse.retain(|b| b.id.as_str() != "haupt");
    assert!(client.neu_laden(kaputt).is_err());
    assert_eq!(client.matrix().busse().len(), 2);

    client.beenden().await;
}

#[tokio::test]
async fn ohne_signaling_server_startet_der_client_nicht() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let adresse = listener.local_addr().unwrap().to_string();
    drop(listener);

    assert!(Client::starten(test_config(adresse)).await.is_err());
}
